//! Domain errors for the Arbor orchestration engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Persistence and validation errors raised by domain models and stores.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Thought tree node not found: {0}")]
    NodeNotFound(Uuid),

    #[error("Agent not found: {0}")]
    AgentNotFound(Uuid),

    #[error("Orchestrator not found: {0}")]
    OrchestratorNotFound(Uuid),

    #[error("Execution record not found: {0}")]
    RecordNotFound(Uuid),

    #[error("Invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition { from: String, to: String, reason: String },

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

pub type DomainResult<T> = Result<T, DomainError>;

impl From<sqlx::Error> for DomainError {
    fn from(err: sqlx::Error) -> Self {
        DomainError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::SerializationError(err.to_string())
    }
}

/// Classification of an orchestration failure, carried in results and records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No budget or slot became available in time.
    ResourceExhausted,
    /// Retryable failure that has not yet exhausted its budget.
    Transient,
    /// Transient failure whose retry budget ran out.
    TransientExhausted,
    /// Non-retryable failure.
    Permanent,
    /// Child outcomes could not be synthesized into an acceptable result.
    CoordinationFailure,
    /// The recursion-depth ceiling was hit.
    DepthExceeded,
    /// Work stopped at a checkpoint after a cancel signal.
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ResourceExhausted => "resource_exhausted",
            Self::Transient => "transient",
            Self::TransientExhausted => "transient_exhausted",
            Self::Permanent => "permanent",
            Self::CoordinationFailure => "coordination_failure",
            Self::DepthExceeded => "depth_exceeded",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the failure bubbles to the parent's partial-failure policy
    /// instead of being retried locally.
    pub fn is_permanent(&self) -> bool {
        !matches!(self, Self::Transient)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Orchestration failures. Every variant resolves into an `OrchestratorResult`
/// before reaching a caller.
#[derive(Debug, Clone, Error)]
pub enum OrchestrationError {
    #[error("Resource exhausted: requested {requested} slot(s), {available} available after {waited_ms}ms")]
    ResourceExhausted { requested: usize, available: usize, waited_ms: u64 },

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Transient failure persisted after {attempts} attempt(s): {last_error}")]
    TransientExhausted { attempts: u32, last_error: String },

    #[error("Permanent failure: {0}")]
    Permanent(String),

    #[error("Coordination failure: {completed} of {total} children completed ({reason})")]
    CoordinationFailure { completed: usize, total: usize, reason: String },

    #[error("Recursion depth {depth} exceeds ceiling {max_depth}")]
    DepthExceeded { depth: u32, max_depth: u32 },

    #[error("Cancelled before {0}")]
    Cancelled(String),
}

impl OrchestrationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            Self::Transient(_) => ErrorKind::Transient,
            Self::TransientExhausted { .. } => ErrorKind::TransientExhausted,
            Self::Permanent(_) => ErrorKind::Permanent,
            Self::CoordinationFailure { .. } => ErrorKind::CoordinationFailure,
            Self::DepthExceeded { .. } => ErrorKind::DepthExceeded,
            Self::Cancelled(_) => ErrorKind::Cancelled,
        }
    }
}

impl From<DomainError> for OrchestrationError {
    fn from(err: DomainError) -> Self {
        OrchestrationError::Permanent(err.to_string())
    }
}

pub type OrchestrationResult<T> = Result<T, OrchestrationError>;
