//! Network Module
//!
//! Handles TCP communication between nodes and clients. Every connection
//! carries [`MessageCodec`](crate::protocol::MessageCodec) frames; replies
//! travel back on the connection that carried the request.

mod client;
mod server;

pub use client::PeerClient;
pub use server::{MessageHandler, NetworkServer};
