//! Error types for the replication layer

use thiserror::Error;

/// Result type for replication operations
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur on the replicated write path
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// The nodes configuration string could not be parsed
    #[error("Invalid nodes configuration: {0}")]
    ConfigParse(String),

    /// The consensus node could not be initialized
    #[error("Failed to initialize consensus node: {0}")]
    NodeInit(String),

    /// The local store failed to open
    #[error("Failed to open store: {0}")]
    StoreOpen(String),

    /// Domain collections failed to load; fatal at startup
    #[error("Could not load collections from disk: {0}")]
    CollectionsLoad(String),

    /// Creating a store checkpoint failed
    #[error("Checkpoint failed: {0}")]
    Checkpoint(String),

    /// The snapshot writer rejected a file
    #[error("Failed to add file to snapshot: {0}")]
    SnapshotAddFile(String),

    /// A follower received a write but no leader is known
    #[error("Could not find a leader.")]
    LeaderUnknown,

    /// This node is not the leader; writes must be forwarded
    #[error("Not leader; current leader api address: {leader_api_addr:?}")]
    NotLeader { leader_api_addr: Option<String> },

    /// Forwarding is not implemented for this HTTP method
    #[error("Forwarding for http method not implemented: {0}")]
    ForwardMethodUnsupported(String),

    /// The write was submitted at a term that is no longer current
    #[error("Leader term changed (expected {expected}, entry committed at {current})")]
    TermMismatch { expected: u64, current: u64 },

    /// Failed to serialize/deserialize a log payload
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Network error while talking to a peer
    #[error("Network error: {0}")]
    Network(String),

    /// The node is shutting down
    #[error("Shutting down")]
    Shutdown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    pub fn node_init(msg: impl Into<String>) -> Self {
        ReplicationError::NodeInit(msg.into())
    }

    pub fn checkpoint(msg: impl Into<String>) -> Self {
        ReplicationError::Checkpoint(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ReplicationError::Internal(msg.into())
    }

    /// Returns true if retrying against the cluster might succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReplicationError::NotLeader { .. }
                | ReplicationError::LeaderUnknown
                | ReplicationError::Network(_)
                | ReplicationError::TermMismatch { .. }
        )
    }

    /// HTTP status code this error maps to when surfaced to a client
    pub fn status_code(&self) -> u16 {
        match self {
            ReplicationError::LeaderUnknown
            | ReplicationError::NotLeader { .. }
            | ReplicationError::TermMismatch { .. } => 500,
            ReplicationError::ForwardMethodUnsupported(_) => 500,
            ReplicationError::Serialization(_) => 400,
            _ => 500,
        }
    }
}

impl From<sift_commons::ClusterParseError> for ReplicationError {
    fn from(err: sift_commons::ClusterParseError) -> Self {
        ReplicationError::ConfigParse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leader_unknown_message_matches_http_body() {
        assert_eq!(
            ReplicationError::LeaderUnknown.to_string(),
            "Could not find a leader."
        );
    }

    #[test]
    fn retryable_classification() {
        assert!(ReplicationError::LeaderUnknown.is_retryable());
        assert!(ReplicationError::Network("down".into()).is_retryable());
        assert!(!ReplicationError::ConfigParse("bad".into()).is_retryable());
        assert!(!ReplicationError::Shutdown.is_retryable());
    }
}
