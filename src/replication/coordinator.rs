//! Replication Coordinator
//!
//! Routes client statements: reads run locally on every node, writes run on
//! the coordinator and are fanned out to followers. Followers forward writes
//! to the coordinator and relay its answer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use super::stream::ReplicationStreams;
use crate::error::Error;
use crate::network::PeerClient;
use crate::protocol::{
    Message, MessageKind, NodeId, QueryRequest, QueryResponse, Replicate, ReplicateAck,
};
use crate::state::{ClusterMembership, ElectionCoordinator};
use crate::storage::{classify, QueryResult, StatementKind, StorageAdapter};

pub struct ReplicationCoordinator {
    membership: Arc<ClusterMembership>,
    election: Arc<ElectionCoordinator>,
    storage: Arc<dyn StorageAdapter>,
    client: PeerClient,
    streams: ReplicationStreams,
    /// Serializes local execution and enqueueing of writes
    write_lock: Mutex<()>,
    query_timeout: Duration,
}

impl ReplicationCoordinator {
    pub fn new(
        membership: Arc<ClusterMembership>,
        election: Arc<ElectionCoordinator>,
        storage: Arc<dyn StorageAdapter>,
        client: PeerClient,
        streams: ReplicationStreams,
        query_timeout: Duration,
    ) -> Self {
        Self {
            membership,
            election,
            storage,
            client,
            streams,
            write_lock: Mutex::new(()),
            query_timeout,
        }
    }

    fn self_id(&self) -> NodeId {
        self.membership.self_id()
    }

    /// Execute or route one statement and build the reply for the requester
    pub async fn handle_statement(&self, request: QueryRequest) -> Message {
        match classify(&request.sql) {
            StatementKind::Read => {
                let result = QueryResult::from(self.storage.execute(&request.sql).await);
                self.respond(result).await
            }
            StatementKind::Write => {
                if self.membership.is_coordinator().await {
                    let result = self.execute_write(&request.sql).await;
                    self.respond(result).await
                } else if request.forwarded {
                    let coordinator = self.membership.coordinator_id().await;
                    Message::error(self.self_id(), Error::NotCoordinator(coordinator).to_string())
                } else {
                    self.forward(request).await
                }
            }
        }
    }

    /// Apply a write locally and queue it for every follower on success
    async fn execute_write(&self, sql: &str) -> QueryResult {
        let _guard = self.write_lock.lock().await;

        match self.storage.execute(sql).await {
            Ok(output) => {
                let queued = self.streams.enqueue(sql);
                tracing::debug!("Write applied on coordinator, queued for {}/{} peers", queued, self.streams.len());
                QueryResult::ok(output)
            }
            Err(e) => {
                // Un-appliable statements are never replicated
                tracing::debug!("Write failed on coordinator: {}", e);
                QueryResult::error(e.to_string())
            }
        }
    }

    /// Relay a client write to the coordinator
    async fn forward(&self, request: QueryRequest) -> Message {
        let coordinator = self.membership.coordinator_id().await;
        let forwarded = QueryRequest {
            sql: request.sql,
            forwarded: true,
        };

        let msg = match Message::new(MessageKind::QueryRequest, self.self_id(), &forwarded) {
            Ok(msg) => msg,
            Err(e) => return Message::error(self.self_id(), e.to_string()),
        };

        tracing::debug!("Forwarding write to coordinator {}", coordinator);
        match self.client.request(coordinator, &msg, self.query_timeout).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!("Coordinator {} unreachable while forwarding: {}", coordinator, e);
                if e.is_peer_failure() {
                    let election = Arc::clone(&self.election);
                    tokio::spawn(async move {
                        election.start_election().await;
                    });
                }
                Message::error(self.self_id(), Error::CoordinatorUnavailable(coordinator).to_string())
            }
        }
    }

    async fn respond(&self, result: QueryResult) -> Message {
        let response = QueryResponse {
            node: self.self_id(),
            coordinator: self.membership.is_coordinator().await,
            result,
        };
        Message::new(MessageKind::QueryResponse, self.self_id(), &response)
            .unwrap_or_else(|e| Message::error(self.self_id(), e.to_string()))
    }

    /// Apply a statement replicated by the coordinator
    pub async fn on_replicate(&self, from: NodeId, replicate: Replicate) -> Option<Message> {
        let applied = match self.storage.execute(&replicate.sql).await {
            Ok(_) => {
                tracing::trace!("Applied replicated statement from node {}", from);
                true
            }
            Err(e) => {
                tracing::warn!("Replicated statement from node {} failed: {}", from, e);
                false
            }
        };

        if !replicate.ack {
            return None;
        }
        Message::new(MessageKind::ReplicateAck, self.self_id(), &ReplicateAck { applied }).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeEntry;
    use crate::storage::MemoryStorage;
    use tokio::sync::watch;

    struct Fixture {
        coordinator: ReplicationCoordinator,
        storage: Arc<MemoryStorage>,
        membership: Arc<ClusterMembership>,
        _shutdown: watch::Sender<bool>,
    }

    /// Node 1 with peers 2 and 3 that nobody serves
    fn fixture() -> Fixture {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let entries: Vec<NodeEntry> = [2, 3]
            .iter()
            .map(|&id| NodeEntry {
                id,
                host: "127.0.0.1".into(),
                port,
                database: None,
            })
            .collect();
        let client = PeerClient::new(&entries);

        let membership = Arc::new(ClusterMembership::new(1, vec![2, 3]));
        let election = Arc::new(ElectionCoordinator::new(
            Arc::clone(&membership),
            client.clone(),
            Duration::from_millis(200),
        ));
        let storage = Arc::new(MemoryStorage::new().unwrap());
        let (tx, rx) = watch::channel(false);
        let streams = ReplicationStreams::spawn(1, &[2, 3], client.clone(), 8, Duration::from_millis(200), rx);

        Fixture {
            coordinator: ReplicationCoordinator::new(
                Arc::clone(&membership),
                election,
                storage.clone(),
                client,
                streams,
                Duration::from_millis(500),
            ),
            storage,
            membership,
            _shutdown: tx,
        }
    }

    fn query(sql: &str, forwarded: bool) -> QueryRequest {
        QueryRequest {
            sql: sql.to_string(),
            forwarded,
        }
    }

    fn result_of(msg: &Message) -> QueryResponse {
        assert_eq!(msg.kind(), MessageKind::QueryResponse, "{:?}", msg.error_message());
        msg.payload_as().unwrap()
    }

    #[tokio::test]
    async fn test_coordinator_executes_writes_locally() {
        let f = fixture();
        f.membership.mark_active().await;

        let reply = f.coordinator.handle_statement(query("CREATE TABLE t (id INT)", false)).await;
        let response = result_of(&reply);
        assert!(response.coordinator);
        assert!(response.result.is_ok());

        let reply = f.coordinator.handle_statement(query("INSERT INTO t (id) VALUES (1)", false)).await;
        assert_eq!(result_of(&reply).result.affected_rows, 1);

        let reply = f.coordinator.handle_statement(query("SELECT * FROM t", false)).await;
        assert_eq!(result_of(&reply).result.rows.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_reported() {
        let f = fixture();
        let reply = f.coordinator.handle_statement(query("INSERT INTO missing (id) VALUES (1)", false)).await;
        let response = result_of(&reply);
        assert!(!response.result.is_ok());
        assert!(response.result.message.is_some());
    }

    #[tokio::test]
    async fn test_follower_reads_locally() {
        let f = fixture();
        f.storage.execute("CREATE TABLE t (id INT)").await.unwrap();
        f.membership.set_coordinator(3).await;

        let reply = f.coordinator.handle_statement(query("SELECT * FROM t", false)).await;
        let response = result_of(&reply);
        assert!(!response.coordinator);
        assert_eq!(response.node, 1);
    }

    #[tokio::test]
    async fn test_forwarded_write_on_follower_rejected() {
        let f = fixture();
        f.membership.set_coordinator(3).await;

        let reply = f.coordinator.handle_statement(query("INSERT INTO t (id) VALUES (1)", true)).await;
        assert_eq!(reply.kind(), MessageKind::Error);
        assert!(reply.error_message().unwrap().contains("coordinator is 3"));
        assert!(f.storage.executed().await.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_coordinator() {
        let f = fixture();
        f.membership.set_coordinator(3).await;

        let reply = f.coordinator.handle_statement(query("INSERT INTO t (id) VALUES (1)", false)).await;
        assert_eq!(reply.kind(), MessageKind::Error);
        assert_eq!(reply.error_message().unwrap(), "Coordinator 3 unavailable");
        // Never executed locally on a follower
        assert!(f.storage.executed().await.is_empty());
    }

    #[tokio::test]
    async fn test_on_replicate() {
        let f = fixture();
        f.membership.set_coordinator(3).await;

        let ack = f
            .coordinator
            .on_replicate(3, Replicate { sql: "CREATE TABLE t (id INT)".into(), ack: true })
            .await
            .unwrap();
        assert!(ack.payload_as::<ReplicateAck>().unwrap().applied);

        let none = f
            .coordinator
            .on_replicate(3, Replicate { sql: "INSERT INTO t (id) VALUES (5)".into(), ack: false })
            .await;
        assert!(none.is_none());
        assert_eq!(f.storage.table_rows("t").await.unwrap().len(), 1);
    }
}
