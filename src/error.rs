//! Core error taxonomy.
//!
//! A single error enum is shared by every component in this crate, the same
//! way the teacher crate centralises its error handling in one enum rather
//! than letting each layer invent its own `Result` type.

use uuid::Uuid;

/// Errors produced by the scheduling core.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// No job exists with the given id.
    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    /// No task exists with the given id.
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// No agent exists with the given id.
    #[error("agent not found: {0}")]
    AgentNotFound(i64),

    /// No hashlist exists with the given id.
    #[error("hashlist not found: {0}")]
    HashlistNotFound(Uuid),

    /// Underlying storage error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON (de)serialization error, usually on agent metadata or payloads.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error while materialising or scanning rule chunks / data-dir trees.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An operation attempted to violate a data-model invariant (spec.md §3).
    ///
    /// These are not routine failures: the transaction that produced them is
    /// aborted and the operation is retried on the scheduler's next tick
    /// rather than propagated to a caller as a user-visible error.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Configuration was rejected at admission time (e.g. priority out of range).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An operation timed out waiting on an agent session.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The agent's session channel is no longer open.
    #[error("session closed for agent {0}")]
    SessionClosed(i64),

    /// Catch-all for conditions that should not occur in practice.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result alias used throughout the core.
pub type CoreResult<T> = Result<T, CoreError>;
