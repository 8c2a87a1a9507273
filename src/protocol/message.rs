//! Protocol Messages
//!
//! Defines the logical message exchanged between nodes and clients.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::storage::{DumpSnapshot, QueryResult};

/// Cluster node identifier. Higher ids win elections.
pub type NodeId = u32;

/// Origin used by external clients, which have no node identity
pub const CLIENT_ORIGIN: NodeId = 0;

/// Closed set of message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    QueryRequest,
    QueryResponse,
    Replicate,
    ReplicateAck,
    Heartbeat,
    HeartbeatAck,
    Election,
    ElectionAck,
    CoordinatorAnnounce,
    WhoIsCoordinator,
    CoordinatorReply,
    SyncRequest,
    SyncData,
    Error,
    /// Any type this build does not know about; ignored after validation
    #[serde(other)]
    Unknown,
}

impl MessageKind {
    /// Wire name of the kind (for logging)
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::QueryRequest => "QUERY_REQUEST",
            MessageKind::QueryResponse => "QUERY_RESPONSE",
            MessageKind::Replicate => "REPLICATE",
            MessageKind::ReplicateAck => "REPLICATE_ACK",
            MessageKind::Heartbeat => "HEARTBEAT",
            MessageKind::HeartbeatAck => "HEARTBEAT_ACK",
            MessageKind::Election => "ELECTION",
            MessageKind::ElectionAck => "ELECTION_ACK",
            MessageKind::CoordinatorAnnounce => "COORDINATOR_ANNOUNCE",
            MessageKind::WhoIsCoordinator => "WHO_IS_COORDINATOR",
            MessageKind::CoordinatorReply => "COORDINATOR_REPLY",
            MessageKind::SyncRequest => "SYNC_REQUEST",
            MessageKind::SyncData => "SYNC_DATA",
            MessageKind::Error => "ERROR",
            MessageKind::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A protocol message. Immutable once constructed; the checksum always
/// covers the canonical encoding of the payload it was built with.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    kind: MessageKind,
    origin: NodeId,
    payload: serde_json::Value,
    checksum: String,
}

impl Message {
    /// Build a message from a typed payload
    pub fn new<P: Serialize>(kind: MessageKind, origin: NodeId, payload: &P) -> Result<Self> {
        let payload = serde_json::to_value(payload)?;
        Ok(Self::from_value(kind, origin, payload))
    }

    /// Build a message with an empty payload
    pub fn empty(kind: MessageKind, origin: NodeId) -> Self {
        Self::from_value(kind, origin, serde_json::Value::Object(Default::default()))
    }

    /// Build a message from an already structured payload
    pub fn from_value(kind: MessageKind, origin: NodeId, payload: serde_json::Value) -> Self {
        let checksum = payload_checksum(&canonical_bytes(&payload));
        Self { kind, origin, payload, checksum }
    }

    /// Reassemble a received message. The caller has verified `checksum`
    /// against the payload bytes.
    pub(crate) fn from_parts(
        kind: MessageKind,
        origin: NodeId,
        payload: serde_json::Value,
        checksum: String,
    ) -> Self {
        Self { kind, origin, payload, checksum }
    }

    /// Error reply carrying a human-readable reason
    pub fn error(origin: NodeId, message: impl Into<String>) -> Self {
        let payload = serde_json::json!({ "message": message.into() });
        Self::from_value(MessageKind::Error, origin, payload)
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn origin(&self) -> NodeId {
        self.origin
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// Canonical payload bytes, the exact bytes the checksum covers
    pub fn payload_bytes(&self) -> Vec<u8> {
        canonical_bytes(&self.payload)
    }

    /// Decode the payload into a typed structure
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Reason carried by an `ERROR` message, if any
    pub fn error_message(&self) -> Option<String> {
        if self.kind != MessageKind::Error {
            return None;
        }
        self.payload_as::<ErrorPayload>().ok().map(|p| p.message)
    }
}

/// Deterministic encoding of a payload. `serde_json::Map` keeps keys sorted,
/// so equal payloads always produce equal bytes.
pub fn canonical_bytes(payload: &serde_json::Value) -> Vec<u8> {
    // Serializing a Value cannot fail: keys are always strings
    serde_json::to_vec(payload).unwrap_or_default()
}

/// Hex SHA-256 digest of payload bytes
pub fn payload_checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

// ========== Payloads ==========

/// `QUERY_REQUEST`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub sql: String,
    /// Set when a follower relays a client write to the coordinator
    #[serde(default)]
    pub forwarded: bool,
}

/// `QUERY_RESPONSE`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    /// Node that executed the statement
    pub node: NodeId,
    /// Whether the executing node was the coordinator
    pub coordinator: bool,
    pub result: QueryResult,
}

/// `REPLICATE`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Replicate {
    pub sql: String,
    /// Ask the follower for a `REPLICATE_ACK` once applied
    #[serde(default)]
    pub ack: bool,
}

/// `REPLICATE_ACK`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicateAck {
    pub applied: bool,
}

/// `COORDINATOR_REPLY`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorReply {
    /// Coordinator the replying node currently follows
    pub coordinator_id: NodeId,
    /// The replying node claims the coordinator role itself
    pub is_coordinator: bool,
}

/// `SYNC_DATA`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncData {
    pub snapshot: DumpSnapshot,
}

/// `ERROR`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_wire_names() {
        let json = serde_json::to_string(&MessageKind::CoordinatorAnnounce).unwrap();
        assert_eq!(json, "\"COORDINATOR_ANNOUNCE\"");

        let kind: MessageKind = serde_json::from_str("\"WHO_IS_COORDINATOR\"").unwrap();
        assert_eq!(kind, MessageKind::WhoIsCoordinator);

        let unknown: MessageKind = serde_json::from_str("\"GOSSIP\"").unwrap();
        assert_eq!(unknown, MessageKind::Unknown);
    }

    #[test]
    fn test_checksum_independent_of_key_order() {
        let a: serde_json::Value = serde_json::from_str(r#"{"sql":"SELECT 1","forwarded":false}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"forwarded":false,"sql":"SELECT 1"}"#).unwrap();

        let ma = Message::from_value(MessageKind::QueryRequest, 1, a);
        let mb = Message::from_value(MessageKind::QueryRequest, 1, b);
        assert_eq!(ma.checksum(), mb.checksum());
        assert_eq!(ma.checksum(), payload_checksum(&ma.payload_bytes()));
    }

    #[test]
    fn test_typed_payload() {
        let msg = Message::new(
            MessageKind::Replicate,
            3,
            &Replicate { sql: "INSERT INTO t VALUES (1)".into(), ack: true },
        )
        .unwrap();

        let replicate: Replicate = msg.payload_as().unwrap();
        assert_eq!(replicate.sql, "INSERT INTO t VALUES (1)");
        assert!(replicate.ack);
        assert_eq!(msg.origin(), 3);
    }

    #[test]
    fn test_error_message() {
        let msg = Message::error(2, "coordinator 3 unavailable");
        assert_eq!(msg.kind(), MessageKind::Error);
        assert_eq!(msg.error_message().as_deref(), Some("coordinator 3 unavailable"));
        assert_eq!(Message::empty(MessageKind::Heartbeat, 1).error_message(), None);
    }
}
