//! PeerDB Error Types

use thiserror::Error;

use crate::protocol::NodeId;

/// Result type alias for PeerDB operations
pub type Result<T> = std::result::Result<T, Error>;

/// Failure to turn a received frame back into a [`Message`](crate::protocol::Message)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Incomplete, oversized or otherwise malformed frame
    #[error("Framing error: {0}")]
    Framing(String),

    /// Payload digest does not match the carried checksum
    #[error("Checksum mismatch: carried {carried}, computed {computed}")]
    ChecksumMismatch { carried: String, computed: String },
}

/// PeerDB error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Wire errors
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unexpected reply from node {node}: {kind}")]
    UnexpectedReply { node: NodeId, kind: String },

    // Storage errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    // Cluster errors
    #[error("Node {node} unreachable: {reason}")]
    PeerUnreachable { node: NodeId, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("Coordinator {0} unavailable")]
    CoordinatorUnavailable(NodeId),

    #[error("Not coordinator: current coordinator is {0}")]
    NotCoordinator(NodeId),

    #[error("Node is still joining the cluster")]
    Joining,

    #[error("Sync failed: {0}")]
    Sync(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error means the remote peer should be treated as down
    pub fn is_peer_failure(&self) -> bool {
        matches!(
            self,
            Error::PeerUnreachable { .. }
                | Error::ConnectionTimeout(_)
                | Error::Io(_)
        )
    }

    /// Check if this error must stop the process at startup
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_) | Error::ConfigParse(_))
    }

    /// Wrap a framing failure
    pub fn framing(reason: impl Into<String>) -> Self {
        Error::Decode(DecodeError::Framing(reason.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let unreachable = Error::PeerUnreachable {
            node: 3,
            reason: "connection refused".into(),
        };
        assert!(unreachable.is_peer_failure());
        assert!(!unreachable.is_fatal());

        assert!(Error::Config("node.id missing".into()).is_fatal());
        assert!(!Error::Storage("duplicate key".into()).is_peer_failure());
    }

    #[test]
    fn test_decode_error_display() {
        let err: Error = DecodeError::ChecksumMismatch {
            carried: "aa".into(),
            computed: "bb".into(),
        }
        .into();
        assert_eq!(err.to_string(), "Checksum mismatch: carried aa, computed bb");
    }
}
