//! Coordinator Election
//!
//! Bully election: the highest reachable node id becomes coordinator.
//! Followers ping the coordinator periodically and start an election when
//! it stops answering.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;

use crate::network::PeerClient;
use crate::protocol::{Message, MessageKind, NodeId};
use crate::state::ClusterMembership;

/// Control timeouts a deferring node waits for the winner's announcement
const ANNOUNCE_WAIT_TIMEOUTS: u32 = 4;

/// Result of one election attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionOutcome {
    /// No higher node answered; this node announced itself
    Won,
    /// These higher nodes answered and will take over
    Deferred(Vec<NodeId>),
    /// Another election is already running on this node
    AlreadyRunning,
}

/// Election coordinator manages coordinator election and liveness
pub struct ElectionCoordinator {
    membership: Arc<ClusterMembership>,
    client: PeerClient,
    /// Timeout for heartbeat and election messages
    control_timeout: Duration,
}

impl ElectionCoordinator {
    /// Create a new election coordinator
    pub fn new(membership: Arc<ClusterMembership>, client: PeerClient, control_timeout: Duration) -> Self {
        Self {
            membership,
            client,
            control_timeout,
        }
    }

    fn self_id(&self) -> NodeId {
        self.membership.self_id()
    }

    /// Run one Bully round
    pub async fn start_election(&self) -> ElectionOutcome {
        if !self.membership.try_begin_election().await {
            tracing::debug!("Election already in progress on node {}", self.self_id());
            return ElectionOutcome::AlreadyRunning;
        }

        let higher = self.membership.higher_peers();
        tracing::info!("Node {} starting election (higher peers: {:?})", self.self_id(), higher);

        let msg = Message::empty(MessageKind::Election, self.self_id());
        let replies = join_all(
            higher
                .iter()
                .map(|&peer| self.client.request(peer, &msg, self.control_timeout)),
        )
        .await;

        let acked: Vec<NodeId> = higher
            .iter()
            .zip(replies)
            .filter_map(|(&peer, reply)| match reply {
                Ok(m) if m.kind() == MessageKind::ElectionAck => Some(peer),
                Ok(m) => {
                    tracing::debug!("Node {} answered ELECTION with {}", peer, m.kind());
                    None
                }
                Err(e) => {
                    tracing::debug!("No election answer from node {}: {}", peer, e);
                    None
                }
            })
            .collect();

        if let Some(&highest) = acked.iter().max() {
            tracing::info!("Node {} defers to higher nodes {:?}", self.self_id(), acked);
            let deadline = Instant::now() + self.control_timeout * ANNOUNCE_WAIT_TIMEOUTS;
            self.membership.defer_to(highest, deadline).await;
            return ElectionOutcome::Deferred(acked);
        }

        self.membership.become_coordinator().await;
        self.announce().await;
        ElectionOutcome::Won
    }

    /// Broadcast COORDINATOR_ANNOUNCE to every peer
    async fn announce(&self) {
        let msg = Message::empty(MessageKind::CoordinatorAnnounce, self.self_id());
        tracing::info!("Node {} announcing itself as coordinator", self.self_id());

        join_all(self.membership.peers().iter().map(|&peer| {
            let msg = &msg;
            async move {
                if let Err(e) = self.client.send(peer, msg, self.control_timeout).await {
                    tracing::debug!("Announce to node {} failed: {}", peer, e);
                }
            }
        }))
        .await;
    }

    /// Handle ELECTION from a lower or higher node
    pub fn on_election(self: &Arc<Self>, from: NodeId) -> Option<Message> {
        if self.self_id() <= from {
            // Lower nodes stay silent so the higher candidate proceeds
            return None;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.start_election().await;
        });

        Some(Message::empty(MessageKind::ElectionAck, self.self_id()))
    }

    /// Handle COORDINATOR_ANNOUNCE; no fencing, the last one observed wins
    pub async fn on_coordinator_announce(&self, from: NodeId) {
        tracing::info!("Node {} received coordinator announcement from {}", self.self_id(), from);
        self.membership.set_coordinator(from).await;
    }

    /// Handle HEARTBEAT
    pub async fn on_heartbeat(&self, from: NodeId) -> Message {
        self.membership.record_heartbeat(from).await;
        Message::empty(MessageKind::HeartbeatAck, self.self_id())
    }

    /// Check the coordinator is alive; start an election if it is not, or
    /// if a node this one deferred to never announced itself.
    /// Returns false when an election was triggered.
    pub async fn ping_coordinator(&self) -> bool {
        if self.membership.is_electing().await {
            return true;
        }

        if self.membership.announcement_overdue().await {
            let awaited = self.membership.coordinator_id().await;
            tracing::warn!("Node {} never announced itself, restarting election", awaited);
            self.start_election().await;
            return false;
        }

        if self.membership.is_coordinator().await {
            return true;
        }

        let coordinator = self.membership.coordinator_id().await;
        let msg = Message::empty(MessageKind::Heartbeat, self.self_id());

        match self.client.request(coordinator, &msg, self.control_timeout).await {
            Ok(reply) if reply.kind() == MessageKind::HeartbeatAck => {
                tracing::trace!("Coordinator {} is alive", coordinator);
                true
            }
            Ok(reply) => {
                tracing::warn!("Coordinator {} answered HEARTBEAT with {}", coordinator, reply.kind());
                self.coordinator_failed(coordinator).await;
                false
            }
            Err(e) => {
                tracing::warn!("Coordinator {} unreachable: {}", coordinator, e);
                self.coordinator_failed(coordinator).await;
                false
            }
        }
    }

    async fn coordinator_failed(&self, coordinator: NodeId) {
        // An announcement may have arrived while the ping was in flight
        if self.membership.coordinator_id().await != coordinator {
            return;
        }
        self.start_election().await;
    }
}
