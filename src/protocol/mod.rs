//! Wire Protocol
//!
//! Message model and framing shared by nodes and clients.

pub mod codec;
pub mod message;

pub use codec::{decode, encode, FrameHeader, MessageCodec};
pub use message::{
    CoordinatorReply, ErrorPayload, Message, MessageKind, NodeId, QueryRequest, QueryResponse,
    Replicate, ReplicateAck, SyncData, CLIENT_ORIGIN,
};
