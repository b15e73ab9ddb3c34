//! Error types for causeway.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::flow::FlowFailure;

/// A `Result` alias with [`enum@Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in causeway operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to serialize or deserialize checkpoint/payload data.
    ///
    /// This typically indicates a mismatch between the stored checkpoint
    /// format and the current `Flow::State` type definition.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A checkpoint write would have moved a flow's sequence backwards.
    ///
    /// Checkpoint sequences are strictly monotonic per flow; a resumption
    /// can never observe an older checkpoint than the last one it wrote.
    #[error("checkpoint regression for {flow}: attempted sequence {attempted} <= current {current}")]
    CheckpointRegression {
        flow: String,
        attempted: u64,
        current: u64,
    },

    /// Generic storage failure from the persistence store.
    #[error("storage error: {0}")]
    Storage(String),

    /// PostgreSQL storage error.
    ///
    /// Preserves the full `sqlx::Error` for matching on specific database
    /// error conditions (connection timeout, constraint violation, etc.).
    #[cfg(feature = "postgres")]
    #[error("postgres error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// Flow type was not registered with the manager.
    #[error("unknown flow type: {0}")]
    UnknownFlowType(String),

    /// Flow type was registered more than once.
    #[error("duplicate flow type registration: {0}")]
    DuplicateFlowType(String),

    /// No live flow with the given id.
    #[error("unknown flow: {0}")]
    UnknownFlow(String),

    /// A flow with the given id is already live.
    #[error("flow already exists: {0}")]
    DuplicateFlow(String),

    /// The flow reached the `Failed` state; carries the structured failure
    /// surfaced to the caller.
    #[error("flow failed: {0}")]
    FlowFailed(FlowFailure),

    /// The caller's patience ran out before the flow reached an outcome.
    /// The flow itself keeps running (or stays parked) and is not rolled
    /// back.
    #[error("timed out waiting for the outcome of flow {0}")]
    ResultTimeout(String),

    /// The engine stopped before the flow reached an outcome.
    #[error("flow {0} was interrupted before reaching an outcome")]
    FlowInterrupted(String),

    /// The uniqueness service's request queue is no longer accepting work.
    #[error("uniqueness service unavailable")]
    NotaryUnavailable,
}

impl Error {
    /// Create a generic storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Error::Storage(message.into())
    }
}

/// Classification of a failed action, consumed by the hospital's staff
/// table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Contention or transient failure in the persistence store.
    StorageContention,
    /// Transient network or transport fault.
    NetworkFault,
    /// Integrity-constraint violation; not recoverable by retrying.
    IntegrityViolation,
    /// The transition function or checkpoint data could not be evaluated.
    InvalidTransition,
    /// Unclassified internal failure.
    Internal,
}

impl ErrorKind {
    /// Stable name used in error signatures.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::StorageContention => "storage-contention",
            ErrorKind::NetworkFault => "network-fault",
            ErrorKind::IntegrityViolation => "integrity-violation",
            ErrorKind::InvalidTransition => "invalid-transition",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure raised while executing an action or evaluating a transition.
///
/// Every `ActionError` is classified by the hospital into exactly one
/// disposition before any flow-state mutation is finalized. The
/// `best_effort` flag is stamped by the state machine from the failing
/// action, so fabricated errors (fault injection) are triaged identically
/// to organic ones.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{action} failed ({kind}): {message}")]
pub struct ActionError {
    pub kind: ErrorKind,
    /// Name of the failing action (or pipeline stage).
    pub action: String,
    pub message: String,
    #[serde(default)]
    pub best_effort: bool,
}

impl ActionError {
    /// Create a new action error.
    pub fn new(kind: ErrorKind, action: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            action: action.into(),
            message: message.into(),
            best_effort: false,
        }
    }

    /// A transient network/transport failure.
    pub fn network(action: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::NetworkFault, action, message.to_string())
    }

    /// A storage failure, classified as contention (transient).
    pub fn storage(action: impl Into<String>, error: &Error) -> Self {
        Self::new(ErrorKind::StorageContention, action, error.to_string())
    }

    /// Stamp the best-effort flag from the failing action.
    pub fn for_action<M>(mut self, action: &crate::flow::Action<M>) -> Self {
        self.best_effort = action.is_best_effort();
        self
    }

    /// The error signature the hospital tracks consecutive discharges by.
    pub fn signature(&self) -> String {
        format!("{}:{}", self.action, self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_error_display() {
        let err = ActionError::new(ErrorKind::NetworkFault, "send-initial-message", "boom");
        assert_eq!(
            err.to_string(),
            "send-initial-message failed (network-fault): boom"
        );
    }

    #[test]
    fn signature_combines_action_and_kind() {
        let err = ActionError::new(ErrorKind::StorageContention, "request-commit", "x");
        assert_eq!(err.signature(), "request-commit:storage-contention");
    }

    #[test]
    fn best_effort_stamped_from_action() {
        let ack: crate::flow::Action<()> =
            crate::flow::Action::AcknowledgeMessages { messages: vec![] };
        let err = ActionError::new(ErrorKind::NetworkFault, ack.name(), "x").for_action(&ack);
        assert!(err.best_effort);
    }
}
