//! Domain error model.

use thiserror::Error;

use crate::status::JobStatus;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Deterministic failures only: malformed identifiers, illegal status
/// transitions, result info written at the wrong time. Storage and transport
/// failures belong to the infrastructure layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. empty or unparsable).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// The requested status change is not an edge of the job state machine.
    #[error("illegal status transition {from} -> {to}")]
    IllegalTransition { from: JobStatus, to: JobStatus },

    /// Result info may only be written together with a terminal status.
    #[error("result info cannot be recorded for non-terminal status {0}")]
    ResultInfoOnNonTerminal(JobStatus),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn illegal_transition(from: JobStatus, to: JobStatus) -> Self {
        Self::IllegalTransition { from, to }
    }
}
