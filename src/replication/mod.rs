//! Replication Module
//!
//! Single-writer statement replication: the coordinator applies each write
//! locally and streams it to every follower in order.

mod coordinator;
mod stream;

pub use coordinator::ReplicationCoordinator;
pub use stream::ReplicationStreams;
