//! Periodic re-observation of jobs stuck in ENQUEUE_PENDING.
//!
//! Change events fire only on writes. A job that enters ENQUEUE_PENDING and is
//! never touched again produces no event once its staleness threshold passes,
//! so nothing would ever re-evaluate it. The sweeper lists pending records on
//! an interval and publishes a `Rescan` event for each stale one. Repair still
//! goes through the handlers and the conditional update.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use jobsweep_core::{Clock, JobStatus};
use jobsweep_events::{ChangeEvent, ChangeKind, ChangePublisher};

use crate::handlers::is_stale;
use crate::metadata_store::{MetadataStore, MetadataStoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweeperConfig {
    pub interval: Duration,
    pub staleness_threshold: Duration,
    /// Maximum records inspected per sweep.
    pub batch_limit: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error(transparent)]
    Store(#[from] MetadataStoreError),

    #[error("failed to publish rescan event: {0}")]
    Publish(String),
}

pub struct StaleJobSweeper<S, P> {
    store: S,
    publisher: P,
    clock: Arc<dyn Clock>,
    config: SweeperConfig,
}

impl<S, P> StaleJobSweeper<S, P>
where
    S: MetadataStore,
    P: ChangePublisher,
{
    pub fn new(store: S, publisher: P, clock: Arc<dyn Clock>, config: SweeperConfig) -> Self {
        Self {
            store,
            publisher,
            clock,
            config,
        }
    }

    /// One pass. Returns how many rescan events were published.
    pub async fn sweep_once(&self) -> Result<usize, SweepError> {
        let pending = self
            .store
            .list_by_status(JobStatus::EnqueuePending, self.config.batch_limit)
            .await?;

        let now = self.clock.now();
        let mut published = 0;
        for record in pending
            .iter()
            .filter(|r| is_stale(r.status, r.enqueue_attempt_at, now, self.config.staleness_threshold))
        {
            let event = ChangeEvent::from_snapshot(ChangeKind::Rescan, record, now);
            self.publisher
                .publish(event)
                .map_err(|e| SweepError::Publish(e.to_string()))?;
            published += 1;
        }

        debug!(inspected = pending.len(), published, "stale job sweep finished");
        Ok(published)
    }

    /// Sweep every `interval` until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            threshold_secs = self.config.staleness_threshold.as_secs(),
            "stale job sweeper started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("stale job sweeper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        error!(error = %e, "stale job sweep failed");
                    }
                }
            }
        }
    }
}
