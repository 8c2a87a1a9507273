//! Cluster Membership Management
//!
//! Tracks the current coordinator, peer liveness and the election guard.
//! All mutable state lives in one [`ClusterView`] behind a single lock.

use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::protocol::NodeId;

/// Role of this node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    /// Executes and fans out writes
    Coordinator,
    /// Follows the given coordinator
    Follower(NodeId),
    /// An election started by this node is in progress
    Electing,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Coordinator => write!(f, "COORDINATOR"),
            NodeRole::Follower(id) => write!(f, "FOLLOWER({})", id),
            NodeRole::Electing => write!(f, "ELECTING"),
        }
    }
}

/// Lifecycle phase of this node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodePhase {
    /// Join protocol still running
    Joining,
    /// Caught up and serving clients
    Active,
}

impl std::fmt::Display for NodePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodePhase::Joining => write!(f, "JOINING"),
            NodePhase::Active => write!(f, "ACTIVE"),
        }
    }
}

/// Mutable per-node view of the cluster
#[derive(Debug)]
struct ClusterView {
    coordinator_id: NodeId,
    electing: bool,
    /// Set after deferring to a higher node, cleared by its announcement
    announce_deadline: Option<Instant>,
    /// An announcement arrived while this node's election was running
    announced_during_election: bool,
    phase: NodePhase,
    last_heartbeat_seen: HashMap<NodeId, Instant>,
}

/// Cluster membership tracker
pub struct ClusterMembership {
    /// This node's ID
    self_id: NodeId,
    /// Configured peers, ascending, excluding self
    peers: Vec<NodeId>,
    view: RwLock<ClusterView>,
    started_at: chrono::DateTime<chrono::Utc>,
}

impl ClusterMembership {
    /// Create a tracker. The node starts as coordinator of itself, joining.
    pub fn new(self_id: NodeId, peers: impl IntoIterator<Item = NodeId>) -> Self {
        let mut peers: Vec<NodeId> = peers.into_iter().filter(|p| *p != self_id).collect();
        peers.sort_unstable();
        peers.dedup();

        Self {
            self_id,
            peers,
            view: RwLock::new(ClusterView {
                coordinator_id: self_id,
                electing: false,
                announce_deadline: None,
                announced_during_election: false,
                phase: NodePhase::Joining,
                last_heartbeat_seen: HashMap::new(),
            }),
            started_at: chrono::Utc::now(),
        }
    }

    /// Get this node's ID
    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    /// Get all peer ids (excluding self)
    pub fn peers(&self) -> &[NodeId] {
        &self.peers
    }

    /// Peers that outrank this node
    pub fn higher_peers(&self) -> Vec<NodeId> {
        self.peers.iter().copied().filter(|p| *p > self.self_id).collect()
    }

    pub fn is_peer(&self, id: NodeId) -> bool {
        self.peers.binary_search(&id).is_ok()
    }

    pub async fn coordinator_id(&self) -> NodeId {
        self.view.read().await.coordinator_id
    }

    pub async fn is_coordinator(&self) -> bool {
        self.view.read().await.coordinator_id == self.self_id
    }

    pub async fn role(&self) -> NodeRole {
        let view = self.view.read().await;
        self.role_of(&view)
    }

    fn role_of(&self, view: &ClusterView) -> NodeRole {
        if view.electing {
            NodeRole::Electing
        } else if view.coordinator_id == self.self_id {
            NodeRole::Coordinator
        } else {
            NodeRole::Follower(view.coordinator_id)
        }
    }

    pub async fn phase(&self) -> NodePhase {
        self.view.read().await.phase
    }

    pub async fn is_joining(&self) -> bool {
        self.phase().await == NodePhase::Joining
    }

    /// Leave the joining phase
    pub async fn mark_active(&self) {
        let mut view = self.view.write().await;
        if view.phase != NodePhase::Active {
            view.phase = NodePhase::Active;
            tracing::info!("Node {} is active ({})", self.self_id, self.role_of(&view));
        }
    }

    /// Atomically check and set the election flag. Returns false if an
    /// election is already running on this node.
    pub async fn try_begin_election(&self) -> bool {
        let mut view = self.view.write().await;
        if view.electing {
            return false;
        }
        view.electing = true;
        view.announced_during_election = false;
        true
    }

    pub async fn is_electing(&self) -> bool {
        self.view.read().await.electing
    }

    /// Take the coordinator role and finish any running election
    pub async fn become_coordinator(&self) {
        let mut view = self.view.write().await;
        let previous = view.coordinator_id;
        view.coordinator_id = self.self_id;
        view.electing = false;
        view.announce_deadline = None;

        if previous != self.self_id {
            tracing::info!("Node {} is now coordinator (was following {})", self.self_id, previous);
        }
    }

    /// Follow the given coordinator. Later calls always win.
    pub async fn set_coordinator(&self, id: NodeId) {
        let mut view = self.view.write().await;
        view.announce_deadline = None;
        if view.electing {
            view.announced_during_election = true;
        }
        if view.coordinator_id != id {
            tracing::info!("Node {} now follows coordinator {}", self.self_id, id);
            view.coordinator_id = id;
        }
    }

    /// Finish an election lost to `id` and follow it until it announces
    /// itself or `deadline` passes. Does nothing to the coordinator if an
    /// announcement already arrived during the election.
    pub async fn defer_to(&self, id: NodeId, deadline: Instant) {
        let mut view = self.view.write().await;
        view.electing = false;
        if view.announced_during_election {
            return;
        }

        view.announce_deadline = Some(deadline);
        if view.coordinator_id != id {
            tracing::info!("Node {} waits for node {} to announce itself", self.self_id, id);
            view.coordinator_id = id;
        }
    }

    /// True once a deferred election has waited past its deadline
    pub async fn announcement_overdue(&self) -> bool {
        matches!(self.view.read().await.announce_deadline, Some(deadline) if Instant::now() >= deadline)
    }

    /// Record a heartbeat from a node
    pub async fn record_heartbeat(&self, id: NodeId) {
        let mut view = self.view.write().await;
        view.last_heartbeat_seen.insert(id, Instant::now());
    }

    /// Get cluster summary
    pub async fn snapshot(&self) -> ClusterSummary {
        let view = self.view.read().await;

        ClusterSummary {
            self_id: self.self_id,
            coordinator_id: view.coordinator_id,
            role: self.role_of(&view),
            phase: view.phase,
            started_at: self.started_at,
            peers: self
                .peers
                .iter()
                .map(|&id| PeerSummary {
                    id,
                    last_heartbeat_ms: view
                        .last_heartbeat_seen
                        .get(&id)
                        .map(|t| t.elapsed().as_millis() as u64),
                })
                .collect(),
        }
    }
}

/// Liveness of one peer as seen by this node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSummary {
    pub id: NodeId,
    /// Milliseconds since its last heartbeat, if any was received
    pub last_heartbeat_ms: Option<u64>,
}

/// Cluster summary information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub self_id: NodeId,
    pub coordinator_id: NodeId,
    pub role: NodeRole,
    pub phase: NodePhase,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub peers: Vec<PeerSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initial_state() {
        let cluster = ClusterMembership::new(2, vec![3, 1, 2, 3]);

        assert_eq!(cluster.peers(), &[1, 3]);
        assert_eq!(cluster.higher_peers(), vec![3]);
        assert!(cluster.is_peer(1));
        assert!(!cluster.is_peer(2));

        assert_eq!(cluster.coordinator_id().await, 2);
        assert_eq!(cluster.role().await, NodeRole::Coordinator);
        assert!(cluster.is_joining().await);
    }

    #[tokio::test]
    async fn test_election_flag_is_exclusive() {
        let cluster = ClusterMembership::new(1, vec![2]);

        assert!(cluster.try_begin_election().await);
        assert!(!cluster.try_begin_election().await);
        assert_eq!(cluster.role().await, NodeRole::Electing);

        cluster.become_coordinator().await;
        assert!(!cluster.is_electing().await);
        assert_eq!(cluster.role().await, NodeRole::Coordinator);
        assert!(cluster.try_begin_election().await);
    }

    #[tokio::test]
    async fn test_last_announcement_wins() {
        let cluster = ClusterMembership::new(1, vec![2, 3]);

        cluster.set_coordinator(3).await;
        assert_eq!(cluster.role().await, NodeRole::Follower(3));

        cluster.set_coordinator(2).await;
        assert_eq!(cluster.coordinator_id().await, 2);
        assert!(!cluster.is_coordinator().await);
    }

    #[tokio::test]
    async fn test_deferral_waits_for_announcement() {
        let cluster = ClusterMembership::new(1, vec![2, 3]);
        assert!(cluster.try_begin_election().await);

        cluster.defer_to(3, Instant::now()).await;
        assert_eq!(cluster.role().await, NodeRole::Follower(3));
        assert!(!cluster.is_coordinator().await);
        assert!(cluster.announcement_overdue().await);

        // The announcement clears the deadline even when the id is unchanged
        cluster.set_coordinator(3).await;
        assert!(!cluster.announcement_overdue().await);

        assert!(cluster.try_begin_election().await);
        cluster.defer_to(2, Instant::now()).await;
        assert!(cluster.announcement_overdue().await);
        cluster.become_coordinator().await;
        assert!(!cluster.announcement_overdue().await);
    }

    #[tokio::test]
    async fn test_early_announcement_is_kept_over_deferral() {
        let cluster = ClusterMembership::new(1, vec![2, 3]);
        assert!(cluster.try_begin_election().await);

        cluster.set_coordinator(3).await;
        cluster.defer_to(2, Instant::now()).await;

        assert_eq!(cluster.coordinator_id().await, 3);
        assert!(!cluster.is_electing().await);
        assert!(!cluster.announcement_overdue().await);
    }

    #[tokio::test]
    async fn test_snapshot() {
        let cluster = ClusterMembership::new(1, vec![2, 3]);
        cluster.record_heartbeat(3).await;
        cluster.set_coordinator(3).await;
        cluster.mark_active().await;

        let summary = cluster.snapshot().await;
        assert_eq!(summary.coordinator_id, 3);
        assert_eq!(summary.phase, NodePhase::Active);
        assert_eq!(summary.peers.len(), 2);
        assert!(summary.peers[0].last_heartbeat_ms.is_none());
        assert!(summary.peers[1].last_heartbeat_ms.is_some());

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["role"]["Follower"], 3);
    }
}
