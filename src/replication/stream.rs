//! Replication Streams
//!
//! One delivery worker per peer. Each worker sends `REPLICATE` messages in
//! queue order and waits for the acknowledgement (or timeout) before the
//! next, so a follower applies statements in the coordinator's order.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::network::PeerClient;
use crate::protocol::{Message, MessageKind, NodeId, Replicate, ReplicateAck};

/// Outbound replication queues, one per peer
pub struct ReplicationStreams {
    senders: HashMap<NodeId, mpsc::Sender<String>>,
    workers: Vec<JoinHandle<()>>,
}

impl ReplicationStreams {
    /// Spawn a delivery worker for every peer
    pub fn spawn(
        self_id: NodeId,
        peers: &[NodeId],
        client: PeerClient,
        queue_size: usize,
        ack_timeout: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let mut senders = HashMap::new();
        let mut workers = Vec::new();

        for &peer in peers {
            let (tx, rx) = mpsc::channel(queue_size);
            let worker = StreamWorker {
                self_id,
                peer,
                client: client.clone(),
                ack_timeout,
            };
            workers.push(tokio::spawn(worker.run(rx, shutdown.clone())));
            senders.insert(peer, tx);
        }

        Self { senders, workers }
    }

    /// Queue a statement for every peer. Returns how many peers accepted it.
    pub fn enqueue(&self, sql: &str) -> usize {
        let mut queued = 0;

        for (peer, tx) in &self.senders {
            match tx.try_send(sql.to_string()) {
                Ok(()) => queued += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!("Replication queue for node {} is full, dropping statement", peer);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!("Replication stream to node {} is closed", peer);
                }
            }
        }

        queued
    }

    /// Number of peers with a delivery worker
    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}

impl Drop for ReplicationStreams {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

struct StreamWorker {
    self_id: NodeId,
    peer: NodeId,
    client: PeerClient,
    ack_timeout: Duration,
}

impl StreamWorker {
    async fn run(self, mut rx: mpsc::Receiver<String>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let sql = tokio::select! {
                next = rx.recv() => match next {
                    Some(sql) => sql,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };

            self.deliver(sql).await;
        }

        tracing::debug!("Replication stream to node {} stopped", self.peer);
    }

    /// Send one statement; failures are logged and not retried
    async fn deliver(&self, sql: String) {
        let msg = match Message::new(MessageKind::Replicate, self.self_id, &Replicate { sql, ack: true }) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::error!("Cannot encode replicated statement: {}", e);
                return;
            }
        };

        match self.client.request(self.peer, &msg, self.ack_timeout).await {
            Ok(reply) if reply.kind() == MessageKind::ReplicateAck => {
                match reply.payload_as::<ReplicateAck>() {
                    Ok(ack) if !ack.applied => {
                        tracing::warn!("Node {} failed to apply replicated statement", self.peer);
                    }
                    _ => tracing::trace!("Node {} acknowledged replicated statement", self.peer),
                }
            }
            Ok(reply) => {
                tracing::warn!(
                    "Node {} answered REPLICATE with {}: {}",
                    self.peer,
                    reply.kind(),
                    reply.error_message().unwrap_or_default()
                );
            }
            Err(e) => {
                tracing::warn!("Replication to node {} failed: {}", self.peer, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeEntry;
    use crate::protocol::MessageCodec;
    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;
    use tokio_util::codec::Framed;
    use std::sync::Arc;

    /// Follower stub that records statements and acknowledges them slowly
    async fn recording_peer(received: Arc<Mutex<Vec<String>>>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            loop {
                let (socket, _) = listener.accept().await.unwrap();
                let received = Arc::clone(&received);
                tokio::spawn(async move {
                    let mut framed = Framed::new(socket, MessageCodec);
                    while let Some(Ok(Ok(msg))) = framed.next().await {
                        let replicate: Replicate = msg.payload_as().unwrap();
                        assert!(replicate.ack);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        received.lock().await.push(replicate.sql);

                        let ack = Message::new(MessageKind::ReplicateAck, 2, &ReplicateAck { applied: true }).unwrap();
                        framed.send(&ack).await.unwrap();
                    }
                });
            }
        });

        port
    }

    #[tokio::test]
    async fn test_statements_arrive_in_order() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let port = recording_peer(Arc::clone(&received)).await;

        let client = PeerClient::new(&[NodeEntry {
            id: 2,
            host: "127.0.0.1".into(),
            port,
            database: None,
        }]);
        let (_tx, rx) = watch::channel(false);
        let streams = ReplicationStreams::spawn(1, &[2], client, 16, Duration::from_secs(2), rx);

        let expected: Vec<String> = (0..10)
            .map(|i| format!("INSERT INTO clientes (id) VALUES ({})", i))
            .collect();
        for sql in &expected {
            assert_eq!(streams.enqueue(sql), 1);
        }

        for _ in 0..100 {
            if received.lock().await.len() == expected.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(*received.lock().await, expected);
    }

    #[tokio::test]
    async fn test_full_queue_drops() {
        // Peer that is never served: the worker stays blocked on the first send
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = PeerClient::new(&[NodeEntry {
            id: 2,
            host: "127.0.0.1".into(),
            port,
            database: None,
        }]);
        let (_tx, rx) = watch::channel(false);
        let streams = ReplicationStreams::spawn(1, &[2], client, 2, Duration::from_secs(5), rx);
        assert_eq!(streams.len(), 1);

        let accepted: usize = (0..10).map(|i| streams.enqueue(&format!("DELETE FROM t WHERE id = {}", i))).sum();
        assert!(accepted < 10);
        drop(listener);
    }
}
