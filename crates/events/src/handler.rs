use std::sync::Arc;

use async_trait::async_trait;

use crate::ChangeEvent;

/// Transient failure reported by a handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// A store call exceeded its per-call timeout.
    #[error("{operation} timed out")]
    Timeout { operation: &'static str },

    /// The backing store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Every conditional write lost the race and the predicate still holds.
    #[error("gave up on {job_id} after {attempts} version conflicts")]
    ConflictRetriesExhausted { job_id: String, attempts: u32 },

    #[error("{0}")]
    Other(String),
}

impl HandlerError {
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Whether this failure means the store itself is unreachable.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, HandlerError::Unavailable(_) | HandlerError::Timeout { .. })
    }
}

/// Result of offering a change event to one handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The handler acted and its repair is persisted.
    Handled,
    /// Nothing to do for this event (not applicable, already repaired, raced).
    Skipped,
    /// Transient failure; the dispatcher may offer the event again.
    Retryable(HandlerError),
}

impl HandlerOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, HandlerOutcome::Retryable(_))
    }
}

/// A consumer of metadata change events.
///
/// Handlers decide whether an event concerns them and, if so, attempt a
/// bounded repair. Every handler must be idempotent: the same event may be
/// delivered any number of times, in any order relative to other events for
/// the same job.
///
/// Handlers never see each other's outcomes; the dispatcher offers each event
/// to every registered handler independently.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    /// Stable name used in logs, metrics and failure records.
    fn name(&self) -> &str;

    async fn handle(&self, event: &ChangeEvent) -> HandlerOutcome;
}

#[async_trait]
impl<H> ChangeHandler for Arc<H>
where
    H: ChangeHandler + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn handle(&self, event: &ChangeEvent) -> HandlerOutcome {
        (**self).handle(event).await
    }
}
