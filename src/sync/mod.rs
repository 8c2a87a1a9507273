//! State Transfer
//!
//! Join protocol run once at startup: discover the coordinator, pull a full
//! snapshot from it and load it locally before serving clients. The
//! coordinator side answers discovery and snapshot requests.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use crate::error::{Error, Result};
use crate::network::PeerClient;
use crate::protocol::{CoordinatorReply, Message, MessageKind, NodeId, SyncData};
use crate::state::{ClusterMembership, ElectionCoordinator, ElectionOutcome};
use crate::storage::StorageAdapter;

/// How a join ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Nobody claimed the coordinator role; an election was run
    NoCoordinator(ElectionOutcome),
    /// Snapshot loaded from the coordinator
    Synced { coordinator: NodeId, rows: usize },
    /// The claimed coordinator could not provide a snapshot
    SyncFailed { coordinator: NodeId },
}

pub struct StateTransfer {
    membership: Arc<ClusterMembership>,
    election: Arc<ElectionCoordinator>,
    storage: Arc<dyn StorageAdapter>,
    client: PeerClient,
    discovery_wait: Duration,
    sync_timeout: Duration,
}

impl StateTransfer {
    pub fn new(
        membership: Arc<ClusterMembership>,
        election: Arc<ElectionCoordinator>,
        storage: Arc<dyn StorageAdapter>,
        client: PeerClient,
        discovery_wait: Duration,
        sync_timeout: Duration,
    ) -> Self {
        Self {
            membership,
            election,
            storage,
            client,
            discovery_wait,
            sync_timeout,
        }
    }

    fn self_id(&self) -> NodeId {
        self.membership.self_id()
    }

    /// Join the cluster. Always leaves the node active.
    pub async fn join(&self) -> JoinOutcome {
        tracing::info!("Node {} joining cluster", self.self_id());

        let outcome = match self.discover().await {
            None => {
                tracing::info!("No coordinator found, node {} starts an election", self.self_id());
                JoinOutcome::NoCoordinator(self.election.start_election().await)
            }
            Some(coordinator) => {
                self.membership.set_coordinator(coordinator).await;

                match self.pull_snapshot(coordinator).await {
                    Ok(rows) => {
                        tracing::info!("Synchronized {} rows from coordinator {}", rows, coordinator);
                        if self.self_id() > coordinator {
                            // Rejoining higher node reclaims the role
                            self.election.start_election().await;
                        }
                        JoinOutcome::Synced { coordinator, rows }
                    }
                    Err(e) => {
                        tracing::warn!("Sync from coordinator {} failed: {}", coordinator, e);
                        self.election.start_election().await;
                        JoinOutcome::SyncFailed { coordinator }
                    }
                }
            }
        };

        self.membership.mark_active().await;
        outcome
    }

    /// Ask every peer who the coordinator is; highest claimant wins
    async fn discover(&self) -> Option<NodeId> {
        let msg = Message::empty(MessageKind::WhoIsCoordinator, self.self_id());
        let peers = self.membership.peers();

        let replies = join_all(
            peers
                .iter()
                .map(|&peer| self.client.request(peer, &msg, self.discovery_wait)),
        )
        .await;

        let mut claimants: Vec<NodeId> = peers
            .iter()
            .zip(replies)
            .filter_map(|(&peer, reply)| {
                let reply = reply
                    .map_err(|e| tracing::debug!("No discovery answer from node {}: {}", peer, e))
                    .ok()?;
                let claim: CoordinatorReply = reply.payload_as().ok()?;
                claim.is_coordinator.then_some(peer)
            })
            .collect();

        // An announcement received while waiting is a claim as well
        let announced = self.membership.coordinator_id().await;
        if announced != self.self_id() {
            claimants.push(announced);
        }

        if claimants.len() > 1 {
            tracing::warn!("Several coordinators claimed: {:?}", claimants);
        }
        claimants.into_iter().max()
    }

    /// Request a snapshot and load it
    async fn pull_snapshot(&self, coordinator: NodeId) -> Result<usize> {
        let msg = Message::empty(MessageKind::SyncRequest, self.self_id());
        let reply = self.client.request(coordinator, &msg, self.sync_timeout).await?;

        match reply.kind() {
            MessageKind::SyncData => {
                let data: SyncData = reply.payload_as()?;
                self.storage.restore_from_dump(&data.snapshot).await?;
                Ok(data.snapshot.row_count())
            }
            MessageKind::Error => Err(Error::Sync(reply.error_message().unwrap_or_default())),
            other => Err(Error::UnexpectedReply {
                node: coordinator,
                kind: other.to_string(),
            }),
        }
    }

    /// Answer WHO_IS_COORDINATOR
    pub async fn on_who_is_coordinator(&self) -> Message {
        let coordinator_id = self.membership.coordinator_id().await;
        let is_coordinator = coordinator_id == self.self_id() && !self.membership.is_joining().await;

        let reply = CoordinatorReply {
            coordinator_id,
            is_coordinator,
        };
        Message::new(MessageKind::CoordinatorReply, self.self_id(), &reply)
            .unwrap_or_else(|e| Message::error(self.self_id(), e.to_string()))
    }

    /// Answer SYNC_REQUEST with a full snapshot
    pub async fn on_sync_request(&self, from: NodeId) -> Message {
        let coordinator = self.membership.coordinator_id().await;
        if coordinator != self.self_id() {
            return Message::error(self.self_id(), Error::NotCoordinator(coordinator).to_string());
        }

        let snapshot = match self.storage.full_dump().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!("Cannot dump local state for node {}: {}", from, e);
                return Message::error(self.self_id(), e.to_string());
            }
        };

        tracing::info!(
            "Sending snapshot of {} tables ({} rows) to node {}",
            snapshot.tables.len(),
            snapshot.row_count(),
            from
        );
        Message::new(MessageKind::SyncData, self.self_id(), &SyncData { snapshot })
            .unwrap_or_else(|e| Message::error(self.self_id(), e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::net::TcpListener;
    use tokio::sync::watch;

    use crate::config::NodeEntry;
    use crate::network::{MessageHandler, NetworkServer};
    use crate::storage::{DumpSnapshot, MemoryStorage};

    fn transfer(self_id: NodeId, peers: &[NodeId]) -> (StateTransfer, Arc<MemoryStorage>) {
        transfer_with(self_id, peers, PeerClient::default())
    }

    fn transfer_with(self_id: NodeId, peers: &[NodeId], client: PeerClient) -> (StateTransfer, Arc<MemoryStorage>) {
        let membership = Arc::new(ClusterMembership::new(self_id, peers.iter().copied()));
        let election = Arc::new(ElectionCoordinator::new(
            Arc::clone(&membership),
            client.clone(),
            Duration::from_millis(100),
        ));
        let storage = Arc::new(MemoryStorage::new().unwrap());
        let transfer = StateTransfer::new(
            membership,
            election,
            storage.clone(),
            client,
            Duration::from_millis(100),
            Duration::from_millis(500),
        );
        (transfer, storage)
    }

    #[tokio::test]
    async fn test_lonely_join_elects_self() {
        let (transfer, _) = transfer(2, &[1, 3]);

        let outcome = transfer.join().await;
        assert_eq!(outcome, JoinOutcome::NoCoordinator(ElectionOutcome::Won));
        assert!(transfer.membership.is_coordinator().await);
        assert!(!transfer.membership.is_joining().await);
    }

    #[tokio::test]
    async fn test_joining_node_does_not_claim() {
        let (transfer, _) = transfer(1, &[2]);

        let reply: CoordinatorReply = transfer.on_who_is_coordinator().await.payload_as().unwrap();
        assert_eq!(reply.coordinator_id, 1);
        assert!(!reply.is_coordinator);

        transfer.membership.mark_active().await;
        let reply: CoordinatorReply = transfer.on_who_is_coordinator().await.payload_as().unwrap();
        assert!(reply.is_coordinator);
    }

    #[tokio::test]
    async fn test_sync_request_served_by_coordinator_only() {
        let (transfer, storage) = transfer(3, &[1, 2]);
        storage.execute("CREATE TABLE clientes (id INT, nome VARCHAR(50))").await.unwrap();
        storage.execute("INSERT INTO clientes (id, nome) VALUES (1, 'ana'), (2, 'rui')").await.unwrap();

        let reply = transfer.on_sync_request(1).await;
        assert_eq!(reply.kind(), MessageKind::SyncData);
        let data: SyncData = reply.payload_as().unwrap();
        assert_eq!(data.snapshot.row_count(), 2);

        // Loading it on another node reproduces the table
        let other = MemoryStorage::new().unwrap();
        other.restore_from_dump(&data.snapshot).await.unwrap();
        assert_eq!(other.table_rows("clientes").await, storage.table_rows("clientes").await);

        transfer.membership.set_coordinator(2).await;
        let reply = transfer.on_sync_request(1).await;
        assert_eq!(reply.kind(), MessageKind::Error);
    }

    /// Node 3 claims the role but cannot produce a snapshot
    struct BrokenCoordinator;

    #[async_trait]
    impl MessageHandler for BrokenCoordinator {
        async fn handle(&self, message: Message) -> Option<Message> {
            match message.kind() {
                MessageKind::WhoIsCoordinator => {
                    let claim = CoordinatorReply {
                        coordinator_id: 3,
                        is_coordinator: true,
                    };
                    Message::new(MessageKind::CoordinatorReply, 3, &claim).ok()
                }
                MessageKind::SyncRequest => Some(Message::error(3, "dump failed")),
                _ => None,
            }
        }
    }

    #[tokio::test]
    async fn test_sync_error_falls_back_to_election() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = NetworkServer::from_listener(listener, Arc::new(BrokenCoordinator));
        let port = server.local_addr().unwrap().port();
        let (_shutdown, rx) = watch::channel(false);
        tokio::spawn(server.run(rx));

        let client = PeerClient::new(&[NodeEntry {
            id: 3,
            host: "127.0.0.1".into(),
            port,
            database: None,
        }]);
        let (transfer, storage) = transfer_with(2, &[3], client);

        assert_eq!(transfer.join().await, JoinOutcome::SyncFailed { coordinator: 3 });
        // Node 3 stays silent on ELECTION, so the joiner takes over
        assert!(transfer.membership.is_coordinator().await);
        assert!(!transfer.membership.is_joining().await);
        assert!(storage.table_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_snapshot() {
        let (transfer, _) = transfer(1, &[]);
        let data: SyncData = transfer.on_sync_request(2).await.payload_as().unwrap();
        assert_eq!(data.snapshot, DumpSnapshot::default());
    }
}
