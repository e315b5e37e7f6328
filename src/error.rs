use thiserror::Error;

/// Error kinds crossing the node's layers.
///
/// Semantic variants (`NotLeader`, `NotFound`) travel to the caller
/// unchanged. `Transient` failures are wrapped with context at each layer
/// and stay retryable. `Fatal` means the node must abort rather than
/// diverge from its replicas.
#[derive(Error, Debug)]
pub enum NodeError {
    /// The consensus engine rejected the command because this node is not
    /// the leader. Callers forward to the leader instead.
    #[error("node is not the leader")]
    NotLeader,

    #[error("key doesn't exist")]
    NotFound,

    #[error("couldn't find a leader")]
    LeaderNotFound,

    /// The submitted command failed validation before it was proposed.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Transport or peer failure, safe to retry.
    #[error("transient: {0}")]
    Transient(String),

    /// Store corruption, decode failure on apply, or unusable state.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl NodeError {
    pub fn transient(context: &str, err: impl std::fmt::Display) -> Self {
        NodeError::Transient(format!("{context}: {err}"))
    }

    pub fn fatal(context: &str, err: impl std::fmt::Display) -> Self {
        NodeError::Fatal(format!("{context}: {err}"))
    }

    /// True when the node must not keep applying entries.
    pub fn is_fatal(&self) -> bool {
        matches!(self, NodeError::Fatal(_))
    }
}
