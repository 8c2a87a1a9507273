//! Node Orchestrator
//!
//! Wires membership, election, replication and state transfer together and
//! owns the node lifecycle: bind listener, join the cluster, run the
//! liveness monitor, serve until stopped.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::PeerDbConfig;
use crate::error::{Error, Result};
use crate::network::{MessageHandler, NetworkServer, PeerClient};
use crate::protocol::{Message, MessageKind, NodeId, QueryRequest, Replicate};
use crate::replication::{ReplicationCoordinator, ReplicationStreams};
use crate::state::{ClusterMembership, ElectionCoordinator};
use crate::storage::StorageAdapter;
use crate::sync::{JoinOutcome, StateTransfer};

/// Protocol logic shared by every connection task
struct Dispatcher {
    membership: Arc<ClusterMembership>,
    election: Arc<ElectionCoordinator>,
    replication: ReplicationCoordinator,
    transfer: StateTransfer,
}

impl Dispatcher {
    fn self_id(&self) -> NodeId {
        self.membership.self_id()
    }

    async fn on_query_request(&self, message: Message) -> Message {
        let request: QueryRequest = match message.payload_as() {
            Ok(request) => request,
            Err(e) => return Message::error(self.self_id(), format!("invalid query request: {}", e)),
        };

        if !request.forwarded && self.membership.is_joining().await {
            return Message::error(self.self_id(), Error::Joining.to_string());
        }

        self.replication.handle_statement(request).await
    }

    async fn on_replicate(&self, message: Message) -> Option<Message> {
        match message.payload_as::<Replicate>() {
            Ok(replicate) => self.replication.on_replicate(message.origin(), replicate).await,
            Err(e) => Some(Message::error(self.self_id(), format!("invalid replicate: {}", e))),
        }
    }
}

#[async_trait]
impl MessageHandler for Dispatcher {
    async fn handle(&self, message: Message) -> Option<Message> {
        let kind = message.kind();
        let origin = message.origin();

        // Cluster control traffic must come from a configured peer
        let peer_only = matches!(
            kind,
            MessageKind::Replicate
                | MessageKind::Heartbeat
                | MessageKind::Election
                | MessageKind::CoordinatorAnnounce
                | MessageKind::SyncRequest
        );
        if peer_only && !self.membership.is_peer(origin) {
            tracing::warn!("Rejecting {} from unknown node {}", kind, origin);
            return Some(Message::error(self.self_id(), Error::UnknownNode(origin).to_string()));
        }

        tracing::debug!("Handling {} from {}", kind, origin);

        match kind {
            MessageKind::QueryRequest => Some(self.on_query_request(message).await),
            MessageKind::Replicate => self.on_replicate(message).await,
            MessageKind::Heartbeat => Some(self.election.on_heartbeat(origin).await),
            MessageKind::Election => self.election.on_election(origin),
            MessageKind::CoordinatorAnnounce => {
                self.election.on_coordinator_announce(origin).await;
                None
            }
            MessageKind::WhoIsCoordinator => Some(self.transfer.on_who_is_coordinator().await),
            MessageKind::SyncRequest => Some(self.transfer.on_sync_request(origin).await),
            MessageKind::QueryResponse
            | MessageKind::ReplicateAck
            | MessageKind::HeartbeatAck
            | MessageKind::ElectionAck
            | MessageKind::CoordinatorReply
            | MessageKind::SyncData
            | MessageKind::Error => {
                tracing::debug!("Ignoring unsolicited {} from {}", kind, origin);
                None
            }
            MessageKind::Unknown => {
                tracing::debug!("Ignoring message of unknown type from {}", origin);
                None
            }
        }
    }
}

/// A configured, bound node that has not joined yet
pub struct Node {
    config: PeerDbConfig,
    dispatcher: Arc<Dispatcher>,
    server: NetworkServer,
    shutdown_tx: watch::Sender<bool>,
}

impl Node {
    /// Validate the configuration and bind the listener
    pub async fn new(config: PeerDbConfig, storage: Arc<dyn StorageAdapter>) -> Result<Self> {
        config.validate()?;
        let address = config.self_entry()?.address();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|e| Error::Config(format!("cannot bind {}: {}", address, e)))?;
        Self::with_listener(config, storage, listener)
    }

    /// Build a node on an already bound listener
    pub fn with_listener(
        config: PeerDbConfig,
        storage: Arc<dyn StorageAdapter>,
        listener: TcpListener,
    ) -> Result<Self> {
        config.validate()?;
        let self_id = config.node.id;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let membership = Arc::new(ClusterMembership::new(self_id, config.peers().map(|p| p.id)));
        let client = PeerClient::new(config.peers());

        let election = Arc::new(ElectionCoordinator::new(
            Arc::clone(&membership),
            client.clone(),
            config.control_timeout(),
        ));

        let streams = ReplicationStreams::spawn(
            self_id,
            membership.peers(),
            client.clone(),
            config.cluster.replication_queue_size,
            config.query_timeout(),
            shutdown_rx,
        );

        let replication = ReplicationCoordinator::new(
            Arc::clone(&membership),
            Arc::clone(&election),
            Arc::clone(&storage),
            client.clone(),
            streams,
            config.query_timeout(),
        );

        let transfer = StateTransfer::new(
            Arc::clone(&membership),
            Arc::clone(&election),
            storage,
            client,
            config.discovery_wait(),
            config.sync_timeout(),
        );

        let dispatcher = Arc::new(Dispatcher {
            membership,
            election,
            replication,
            transfer,
        });
        let server = NetworkServer::from_listener(listener, dispatcher.clone());

        Ok(Self {
            config,
            dispatcher,
            server,
            shutdown_tx,
        })
    }

    pub fn id(&self) -> NodeId {
        self.config.node.id
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.server.local_addr()
    }

    /// Serve, join the cluster, then start the liveness monitor. Returns once
    /// the join protocol has finished.
    pub async fn start(self) -> Result<NodeHandle> {
        let Node {
            config,
            dispatcher,
            server,
            shutdown_tx,
        } = self;

        let local_addr = server.local_addr()?;
        let membership = Arc::clone(&dispatcher.membership);
        let mut tasks = Vec::new();

        let shutdown_rx = shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server.run(shutdown_rx).await {
                tracing::error!("Network server error: {}", e);
            }
        }));

        let outcome = dispatcher.transfer.join().await;
        tracing::info!("Node {} joined: {:?}", config.node.id, outcome);

        tasks.push(spawn_liveness_monitor(
            Arc::clone(&dispatcher.election),
            config.heartbeat_interval(),
            shutdown_tx.subscribe(),
        ));

        Ok(NodeHandle {
            id: config.node.id,
            local_addr,
            membership,
            outcome,
            shutdown_tx,
            tasks,
        })
    }
}

/// Ping the coordinator every interval until shutdown
fn spawn_liveness_monitor(
    election: Arc<ElectionCoordinator>,
    interval: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    election.ping_coordinator().await;
                }
                _ = shutdown.changed() => break,
            }
        }

        tracing::debug!("Liveness monitor stopped");
    })
}

/// A running node
pub struct NodeHandle {
    id: NodeId,
    local_addr: SocketAddr,
    membership: Arc<ClusterMembership>,
    outcome: JoinOutcome,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn membership(&self) -> &Arc<ClusterMembership> {
        &self.membership
    }

    /// How the join protocol ended
    pub fn join_outcome(&self) -> &JoinOutcome {
        &self.outcome
    }

    pub async fn coordinator_id(&self) -> NodeId {
        self.membership.coordinator_id().await
    }

    /// Stop serving and wait for the background tasks
    pub async fn shutdown(self) {
        tracing::info!("Stopping node {}", self.id);
        let _ = self.shutdown_tx.send(true);

        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::debug!("Node task ended abnormally: {}", e);
            }
        }
    }
}
