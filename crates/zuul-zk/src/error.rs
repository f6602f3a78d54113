use thiserror::Error;

#[derive(Debug, Error)]
pub enum ZkError {
    #[error("no node at {0}")]
    NoNode(String),
    #[error("node already exists at {0}")]
    NodeExists(String),
    #[error("version mismatch at {path}: expected {expected}, found {actual}")]
    BadVersion {
        path: String,
        expected: i64,
        actual: i64,
    },
    #[error("node at {0} has children")]
    NotEmpty(String),
    #[error("lock on {0} timed out")]
    LockTimeout(String),
    #[error("coordination store session lost")]
    ConnectionLost,
    #[error("{0}")]
    Other(String),
}

impl ZkError {
    /// Spec §7: a `NoNodeError` on an ack/delete is "already acked", not a
    /// fatal condition — callers match on this to downgrade to a warning.
    pub fn is_no_node(&self) -> bool {
        matches!(self, ZkError::NoNode(_))
    }
}
