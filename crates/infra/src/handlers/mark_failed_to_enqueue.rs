//! Fails jobs whose enqueue step never completed.
//!
//! A producer writes the metadata record, moves it to ENQUEUE_PENDING and then
//! pushes a work message. When the push fails the record is left pending with
//! no worker ever coming. Once the record has been pending for longer than the
//! staleness threshold, this handler moves it to FINISHED_FAILED with reason
//! `enqueue-timeout`.
//!
//! The write is a compare-and-swap against the version just read, so a record
//! that a producer moved to IN_PROGRESS in the meantime is never touched.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use jobsweep_core::{Clock, JobMetadata, JobStatus, ResultInfo, StatusUpdate, SystemClock};
use jobsweep_events::{
    ChangeEvent, ChangeHandler, ChangeKind, HandlerError, HandlerOutcome, JobFailedNotice,
    LoggingNotifier, Notifier,
};

use crate::metadata_store::{MetadataStore, MetadataStoreError, UpdateOutcome};

pub const HANDLER_NAME: &str = "mark-failed-to-enqueue";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkFailedToEnqueueConfig {
    pub staleness_threshold: Duration,
    pub call_timeout: Duration,
    /// Re-reads after a version conflict before giving up with `Retryable`.
    pub conflict_retries: u32,
}

impl Default for MarkFailedToEnqueueConfig {
    fn default() -> Self {
        Self {
            staleness_threshold: Duration::from_secs(300),
            call_timeout: Duration::from_secs(5),
            conflict_retries: 3,
        }
    }
}

/// Whether a record in `status`, pending since `enqueue_attempt_at`, is stale
/// at `now`.
///
/// Strict: a record pending for exactly `threshold` is not stale yet.
pub fn is_stale(
    status: JobStatus,
    enqueue_attempt_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    threshold: Duration,
) -> bool {
    let (JobStatus::EnqueuePending, Some(since)) = (status, enqueue_attempt_at) else {
        return false;
    };
    let Ok(threshold) = chrono::Duration::from_std(threshold) else {
        return false;
    };
    now - since > threshold
}

pub struct MarkFailedToEnqueueHandler<S> {
    store: S,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    config: MarkFailedToEnqueueConfig,
}

impl<S> MarkFailedToEnqueueHandler<S>
where
    S: MetadataStore,
{
    pub fn new(store: S, config: MarkFailedToEnqueueConfig) -> Self {
        Self {
            store,
            notifier: Arc::new(LoggingNotifier),
            clock: Arc::new(SystemClock),
            config,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn stale(&self, status: JobStatus, since: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        is_stale(status, since, now, self.config.staleness_threshold)
    }

    async fn call<T, F>(&self, operation: &'static str, fut: F) -> Result<T, HandlerError>
    where
        F: Future<Output = Result<T, MetadataStoreError>> + Send,
    {
        match tokio::time::timeout(self.config.call_timeout, fut).await {
            Ok(result) => result.map_err(|err| store_error(operation, err)),
            Err(_) => Err(HandlerError::Timeout { operation }),
        }
    }

    /// Compare-and-swap to FINISHED_FAILED.
    ///
    /// A `Publish` error means the write committed but its change event was
    /// lost; the committed record is read back and reported as `Updated`.
    async fn fail_record(
        &self,
        record: &JobMetadata,
        update: StatusUpdate,
    ) -> Result<UpdateOutcome, HandlerError> {
        let job_id = &record.job_id;
        let written = tokio::time::timeout(
            self.config.call_timeout,
            self.store.conditional_update(job_id, record.version, update),
        )
        .await;

        match written {
            Ok(Err(MetadataStoreError::Publish(reason))) => {
                warn!(
                    job_id = %job_id,
                    error = %reason,
                    "repair committed but its change event was not published"
                );
                let committed = self.call("get", self.store.get(job_id)).await?;
                match committed {
                    Some(current) if is_own_repair(record, &current) => {
                        Ok(UpdateOutcome::Updated(current))
                    }
                    _ => Err(HandlerError::other(format!(
                        "conditional_update: change event not published: {reason}"
                    ))),
                }
            }
            Ok(result) => result.map_err(|err| store_error("conditional_update", err)),
            Err(_) => Err(HandlerError::Timeout {
                operation: "conditional_update",
            }),
        }
    }

    async fn repair(&self, event: &ChangeEvent) -> Result<HandlerOutcome, HandlerError> {
        let job_id = event.job_id();
        let attempts = self.config.conflict_retries + 1;

        for attempt in 1..=attempts {
            let Some(record) = self.call("get", self.store.get(job_id)).await? else {
                debug!(job_id = %job_id, "record gone, nothing to repair");
                return Ok(HandlerOutcome::Skipped);
            };

            let now = self.clock.now();
            if !self.stale(record.status, record.enqueue_attempt_at, now) {
                debug!(
                    job_id = %job_id,
                    status = %record.status,
                    version = %record.version,
                    "record no longer stale"
                );
                return Ok(HandlerOutcome::Skipped);
            }

            let pending_since = record.enqueue_attempt_at.unwrap_or(record.updated_at);
            let update = StatusUpdate::to(JobStatus::FinishedFailed).with_result_info(
                ResultInfo::enqueue_timeout(pending_since, self.config.staleness_threshold, now),
            );

            let outcome = self.fail_record(&record, update).await?;

            match outcome {
                UpdateOutcome::Updated(failed) => {
                    info!(
                        job_id = %job_id,
                        version = %failed.version,
                        pending_since = %pending_since,
                        "job marked failed: enqueue never completed"
                    );
                    self.notify(&failed).await;
                    return Ok(HandlerOutcome::Handled);
                }
                UpdateOutcome::NotFound => return Ok(HandlerOutcome::Skipped),
                UpdateOutcome::VersionConflict { current } => {
                    debug!(
                        job_id = %job_id,
                        read = %record.version,
                        current = %current,
                        attempt,
                        "version conflict, re-evaluating"
                    );
                }
            }
        }

        Err(HandlerError::ConflictRetriesExhausted {
            job_id: job_id.to_string(),
            attempts,
        })
    }

    async fn notify(&self, record: &JobMetadata) {
        let Some(info) = &record.result_info else {
            return;
        };
        let notice = JobFailedNotice {
            job_id: record.job_id.clone(),
            reason: info.reason.clone(),
            message: info.message.clone(),
            failed_at: record.updated_at,
        };
        if let Err(err) = self.notifier.notify(&notice).await {
            warn!(job_id = %record.job_id, error = %err, "failed to send job failure notice");
        }
    }
}

fn store_error(operation: &'static str, err: MetadataStoreError) -> HandlerError {
    match err {
        MetadataStoreError::Unavailable(msg) => HandlerError::Unavailable(msg),
        err => HandlerError::other(format!("{operation}: {err}")),
    }
}

/// Whether `current` is exactly the snapshot this handler's write produced
/// from `read`.
fn is_own_repair(read: &JobMetadata, current: &JobMetadata) -> bool {
    current.version == read.version.next()
        && current.status == JobStatus::FinishedFailed
        && current
            .result_info
            .as_ref()
            .is_some_and(|info| info.reason == ResultInfo::ENQUEUE_TIMEOUT)
}

#[async_trait]
impl<S> ChangeHandler for MarkFailedToEnqueueHandler<S>
where
    S: MetadataStore,
{
    fn name(&self) -> &str {
        HANDLER_NAME
    }

    async fn handle(&self, event: &ChangeEvent) -> HandlerOutcome {
        if event.kind() == ChangeKind::Remove {
            return HandlerOutcome::Skipped;
        }

        // Cheap check on the snapshot first; most events are not stale pending jobs.
        if !self.stale(event.status(), event.enqueue_attempt_at(), self.clock.now()) {
            return HandlerOutcome::Skipped;
        }

        match self.repair(event).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(job_id = %event.job_id(), error = %err, "repair attempt failed");
                HandlerOutcome::Retryable(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobsweep_core::{JobId, ManualClock, Version};

    use crate::metadata_store::InMemoryMetadataStore;

    /// Reads that take longer than any sane call timeout.
    struct SlowReads {
        inner: InMemoryMetadataStore,
        delay: Duration,
    }

    #[async_trait]
    impl MetadataStore for SlowReads {
        async fn create(&self, job_id: &JobId) -> Result<JobMetadata, MetadataStoreError> {
            self.inner.create(job_id).await
        }

        async fn get(&self, job_id: &JobId) -> Result<Option<JobMetadata>, MetadataStoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.get(job_id).await
        }

        async fn conditional_update(
            &self,
            job_id: &JobId,
            expected: Version,
            update: StatusUpdate,
        ) -> Result<UpdateOutcome, MetadataStoreError> {
            self.inner.conditional_update(job_id, expected, update).await
        }

        async fn delete(&self, job_id: &JobId) -> Result<Option<JobMetadata>, MetadataStoreError> {
            self.inner.delete(job_id).await
        }

        async fn list_by_status(
            &self,
            status: JobStatus,
            limit: usize,
        ) -> Result<Vec<JobMetadata>, MetadataStoreError> {
            self.inner.list_by_status(status, limit).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_store_read_becomes_retryable_timeout() {
        let clock = Arc::new(ManualClock::default());
        let inner = InMemoryMetadataStore::with_clock(clock.clone());
        let id = JobId::new("J1").unwrap();
        let created = inner.create(&id).await.unwrap();
        let UpdateOutcome::Updated(pending) = inner
            .conditional_update(&id, created.version, StatusUpdate::to(JobStatus::EnqueuePending))
            .await
            .unwrap()
        else {
            panic!("pending transition must succeed");
        };

        let store = SlowReads {
            inner,
            delay: Duration::from_secs(30),
        };
        let config = MarkFailedToEnqueueConfig {
            call_timeout: Duration::from_secs(1),
            ..MarkFailedToEnqueueConfig::default()
        };
        let handler = MarkFailedToEnqueueHandler::new(store, config).with_clock(clock.clone());

        clock.advance(Duration::from_secs(301));
        let event = ChangeEvent::from_snapshot(ChangeKind::Modify, &pending, clock.now());
        let outcome = handler.handle(&event).await;

        assert_eq!(
            outcome,
            HandlerOutcome::Retryable(HandlerError::Timeout { operation: "get" })
        );
        assert_eq!(
            handler.store.inner.get(&id).await.unwrap().unwrap().status,
            JobStatus::EnqueuePending
        );
    }

    #[test]
    fn staleness_is_strict_at_the_threshold() {
        let threshold = Duration::from_secs(300);
        let since = Utc::now();
        let at = |secs: i64| since + chrono::Duration::seconds(secs);

        assert!(!is_stale(JobStatus::EnqueuePending, Some(since), at(300), threshold));
        assert!(is_stale(
            JobStatus::EnqueuePending,
            Some(since),
            at(300) + chrono::Duration::milliseconds(1),
            threshold
        ));
        assert!(!is_stale(JobStatus::InProgress, Some(since), at(900), threshold));
        assert!(!is_stale(JobStatus::FinishedFailed, Some(since), at(900), threshold));
        assert!(!is_stale(JobStatus::EnqueuePending, None, at(900), threshold));
    }
}
