//! Operator notifications for repaired jobs.
//!
//! The reconciler only emits [`JobFailedNotice`]s; how they reach people
//! (email, pub/sub topic, pager) is up to the [`Notifier`] wired in at startup.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use jobsweep_core::JobId;

/// Emitted after a job was moved to FINISHED_FAILED by a repair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailedNotice {
    pub job_id: JobId,
    pub reason: String,
    pub message: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: &JobFailedNotice) -> Result<(), NotifyError>;
}

#[async_trait]
impl<N> Notifier for Arc<N>
where
    N: Notifier + ?Sized,
{
    async fn notify(&self, notice: &JobFailedNotice) -> Result<(), NotifyError> {
        (**self).notify(notice).await
    }
}

/// Writes notices to the structured log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn notify(&self, notice: &JobFailedNotice) -> Result<(), NotifyError> {
        info!(
            job_id = %notice.job_id,
            reason = %notice.reason,
            failed_at = %notice.failed_at,
            "job marked failed"
        );
        Ok(())
    }
}

/// Collects notices in memory (tests/dev).
#[derive(Debug, Default)]
pub struct InMemoryNotifier {
    notices: Mutex<Vec<JobFailedNotice>>,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notices(&self) -> Vec<JobFailedNotice> {
        self.notices.lock().map(|n| n.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Notifier for InMemoryNotifier {
    async fn notify(&self, notice: &JobFailedNotice) -> Result<(), NotifyError> {
        self.notices
            .lock()
            .map_err(|_| NotifyError::Delivery("notifier lock poisoned".to_string()))?
            .push(notice.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_notifier_records_notices_in_order() {
        let notifier = InMemoryNotifier::new();
        for id in ["J1", "J2"] {
            let notice = JobFailedNotice {
                job_id: JobId::new(id).unwrap(),
                reason: "enqueue-timeout".to_string(),
                message: "stuck".to_string(),
                failed_at: Utc::now(),
            };
            notifier.notify(&notice).await.unwrap();
        }

        let ids: Vec<_> = notifier
            .notices()
            .into_iter()
            .map(|n| n.job_id.as_str().to_string())
            .collect();
        assert_eq!(ids, vec!["J1", "J2"]);
    }
}
