//! State Management Module
//!
//! Cluster membership, coordinator election and liveness tracking.

mod membership;
pub mod election;

pub use membership::{ClusterMembership, ClusterSummary, NodePhase, NodeRole, PeerSummary};
pub use election::{ElectionCoordinator, ElectionOutcome};
