//! Network Client
//!
//! Outbound connections to peer nodes. One connection per exchange; every
//! wait is bounded by the caller's timeout.

use std::collections::HashMap;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use crate::config::NodeEntry;
use crate::error::{Error, Result};
use crate::protocol::{Message, MessageCodec, NodeId};

/// Client for the static node table
#[derive(Debug, Clone, Default)]
pub struct PeerClient {
    /// Node id -> host:port
    addresses: HashMap<NodeId, String>,
}

impl PeerClient {
    /// Create a client for the given nodes
    pub fn new<'a>(nodes: impl IntoIterator<Item = &'a NodeEntry>) -> Self {
        Self {
            addresses: nodes.into_iter().map(|n| (n.id, n.address())).collect(),
        }
    }

    /// Address of a known node
    pub fn address_of(&self, node: NodeId) -> Result<&str> {
        self.addresses
            .get(&node)
            .map(String::as_str)
            .ok_or(Error::UnknownNode(node))
    }

    /// Known node ids, ascending
    pub fn nodes(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.addresses.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Send a message and wait for the reply on the same connection
    pub async fn request(&self, node: NodeId, message: &Message, wait: Duration) -> Result<Message> {
        let address = self.address_of(node)?;

        match timeout(wait, exchange(node, address, message)).await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    /// Send without waiting for a reply
    pub async fn send(&self, node: NodeId, message: &Message, wait: Duration) -> Result<()> {
        let address = self.address_of(node)?;

        match timeout(wait, deliver(node, address, message)).await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }
}

/// One request/reply exchange on a fresh connection
async fn exchange(node: NodeId, address: &str, message: &Message) -> Result<Message> {
    let mut framed = connect(node, address).await?;
    framed.send(message).await?;

    match framed.next().await {
        Some(Ok(Ok(reply))) => Ok(reply),
        Some(Ok(Err(e))) => Err(Error::Decode(e)),
        Some(Err(e)) => Err(e),
        None => Err(Error::PeerUnreachable {
            node,
            reason: "connection closed without reply".into(),
        }),
    }
}

async fn deliver(node: NodeId, address: &str, message: &Message) -> Result<()> {
    let mut framed = connect(node, address).await?;
    framed.send(message).await?;
    framed.close().await
}

/// Connect to a node
async fn connect(node: NodeId, address: &str) -> Result<Framed<TcpStream, MessageCodec>> {
    let stream = TcpStream::connect(address)
        .await
        .map_err(|e| Error::PeerUnreachable {
            node,
            reason: e.to_string(),
        })?;
    stream.set_nodelay(true)?;
    Ok(Framed::new(stream, MessageCodec))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageKind;

    fn entry(id: NodeId, port: u16) -> NodeEntry {
        NodeEntry {
            id,
            host: "127.0.0.1".into(),
            port,
            database: None,
        }
    }

    #[tokio::test]
    async fn test_unknown_node() {
        let client = PeerClient::new(&[entry(1, 5001)]);
        let msg = Message::empty(MessageKind::Heartbeat, 2);

        let result = client.request(9, &msg, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(Error::UnknownNode(9))));
        assert_eq!(client.nodes(), vec![1]);
    }

    #[tokio::test]
    async fn test_connection_failure_is_peer_failure() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = PeerClient::new(&[entry(3, port)]);
        let msg = Message::empty(MessageKind::Heartbeat, 1);

        let err = client.request(3, &msg, Duration::from_millis(500)).await.unwrap_err();
        assert!(err.is_peer_failure());
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        // Accepts but never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let client = PeerClient::new(&[entry(3, port)]);
        let msg = Message::empty(MessageKind::Heartbeat, 1);

        let err = client.request(3, &msg, Duration::from_millis(200)).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionTimeout(_)));
    }
}
