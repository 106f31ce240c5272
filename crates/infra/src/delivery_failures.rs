//! Permanently failed deliveries.
//!
//! When one handler exhausts its retry budget for one event, the pair is
//! recorded here together with the full event, so the inconsistency stays
//! visible to operators instead of being dropped.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::error;

use jobsweep_events::{ChangeEvent, HandlerError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermanentDeliveryFailure {
    pub event: ChangeEvent,
    pub handler: String,
    pub attempts: u32,
    pub last_error: HandlerError,
    pub failed_at: DateTime<Utc>,
}

impl PermanentDeliveryFailure {
    /// Whether the failure was caused by the metadata store being unreachable.
    pub fn store_unavailable(&self) -> bool {
        self.last_error.is_unavailable()
    }
}

pub trait DeliveryFailureSink: Send + Sync {
    fn record(&self, failure: &PermanentDeliveryFailure);
}

impl<T> DeliveryFailureSink for Arc<T>
where
    T: DeliveryFailureSink + ?Sized,
{
    fn record(&self, failure: &PermanentDeliveryFailure) {
        (**self).record(failure)
    }
}

/// Logs every failure at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingDeliveryFailures;

impl DeliveryFailureSink for LoggingDeliveryFailures {
    fn record(&self, failure: &PermanentDeliveryFailure) {
        error!(
            event_id = %failure.event.event_id(),
            job_id = %failure.event.job_id(),
            status = %failure.event.status(),
            handler = %failure.handler,
            attempts = failure.attempts,
            error = %failure.last_error,
            "permanent delivery failure"
        );
    }
}

/// Keeps failures in memory for inspection (tests/dev).
#[derive(Debug, Default)]
pub struct InMemoryDeliveryFailures {
    failures: Mutex<Vec<PermanentDeliveryFailure>>,
}

impl InMemoryDeliveryFailures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failures(&self) -> Vec<PermanentDeliveryFailure> {
        self.failures.lock().map(|f| f.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.failures.lock().map(|f| f.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DeliveryFailureSink for InMemoryDeliveryFailures {
    fn record(&self, failure: &PermanentDeliveryFailure) {
        LoggingDeliveryFailures.record(failure);
        if let Ok(mut failures) = self.failures.lock() {
            failures.push(failure.clone());
        }
    }
}
