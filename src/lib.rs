//! PeerDB - Peer-to-Peer SQL Middleware
//!
//! Turns a set of independent machines, each running its own local
//! relational engine, into one logically consistent database cluster.
//!
//! # Architecture
//!
//! Clients send statements to any node. Reads are answered locally; writes
//! are routed to a single elected coordinator, applied there and replicated
//! to every follower. Newly joined or recovering nodes catch up through a
//! full state transfer from the coordinator.
//!
//! # Features
//!
//! - Length-prefixed wire frames with SHA-256 payload checksums
//! - Bully coordinator election with periodic liveness checks
//! - Ordered per-peer statement replication
//! - Join protocol with full snapshot transfer
//! - MariaDB and in-memory storage adapters

pub mod config;
pub mod error;
pub mod network;
pub mod node;
pub mod protocol;
pub mod replication;
pub mod state;
pub mod storage;
pub mod sync;

pub use config::PeerDbConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::PeerDbConfig;
    pub use crate::error::{Error, Result};
    pub use crate::node::{Node, NodeHandle};
    pub use crate::protocol::{Message, MessageKind, NodeId};
    pub use crate::state::{ClusterMembership, NodeRole};
    pub use crate::storage::{MariaDbStorage, MemoryStorage, StorageAdapter};
}
