//! Startup wiring: concrete store, change feed, handlers, dispatcher, sweeper.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use jobsweep_core::{Clock, SystemClock};
use jobsweep_events::{ChangePublisher, ChangeSource, InMemoryChangeFeed};
use jobsweep_infra::config::CleanupConfig;
use jobsweep_infra::dispatcher::{Dispatcher, DispatcherStats};
use jobsweep_infra::handlers::{HandlerRegistry, MarkFailedToEnqueueHandler};
use jobsweep_infra::metadata_store::{MetadataStore, PostgresMetadataStore, PublishingMetadataStore};
use jobsweep_infra::sweeper::StaleJobSweeper;

#[cfg(feature = "redis")]
use jobsweep_infra::change_feed::RedisStreamsChangeFeed;

const HEALTH_REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Connect to the metadata store and run the cleanup until `shutdown` resolves.
pub async fn run<F>(config: CleanupConfig, shutdown: F) -> anyhow::Result<DispatcherStats>
where
    F: Future<Output = ()>,
{
    config.validate().context("invalid cleanup configuration")?;
    info!(
        table = %config.metadata_store.table_name,
        region = %config.metadata_store.region,
        retry_budget = config.retry_budget,
        staleness_secs = config.staleness_threshold.as_secs(),
        workers = config.workers,
        "starting failed-enqueue cleanup"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = PostgresMetadataStore::connect(&config.metadata_store, clock.clone())
        .await
        .context("failed to connect to the metadata store")?;
    store
        .ensure_schema()
        .await
        .context("failed to prepare the metadata table")?;
    let store = Arc::new(store);

    match &config.change_stream {
        #[cfg(feature = "redis")]
        Some(stream) => {
            let feed = RedisStreamsChangeFeed::new(stream.clone())
                .context("failed to open the change stream")?;
            feed.ensure_consumer_group()
                .context("failed to create the change stream consumer group")?;
            info!(stream = %stream.stream, group = %stream.group, "using Redis change stream");
            serve(&config, store, Arc::new(feed), clock, shutdown).await
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => anyhow::bail!(
            "CHANGE_STREAM_URL is set but this binary was built without the `redis` feature"
        ),
        None => {
            warn!("no change stream configured; only writes made by this process are observed");
            serve(&config, store, Arc::new(InMemoryChangeFeed::new()), clock, shutdown).await
        }
    }
}

/// Run the dispatcher and sweeper over `store` and `feed` until `shutdown`.
///
/// Generic over the store so the same wiring runs against the in-memory store
/// in tests.
pub async fn serve<S, C, F>(
    config: &CleanupConfig,
    store: Arc<S>,
    feed: Arc<C>,
    clock: Arc<dyn Clock>,
    shutdown: F,
) -> anyhow::Result<DispatcherStats>
where
    S: MetadataStore + 'static,
    C: ChangeSource + ChangePublisher + 'static,
    F: Future<Output = ()>,
{
    // Writes made by handlers go through change capture like any other writer.
    let publishing = Arc::new(PublishingMetadataStore::new(store.clone(), feed.clone()));
    let handler = MarkFailedToEnqueueHandler::new(publishing, config.handler_config())
        .with_clock(clock.clone());
    let registry = HandlerRegistry::new()
        .with(Arc::new(handler))
        .context("failed to register change handlers")?;

    let handle = Dispatcher::new(registry, config.dispatcher_config()).spawn(feed.clone());

    let cancel = CancellationToken::new();
    let sweeper = StaleJobSweeper::new(store, feed, clock, config.sweeper_config());
    let sweeper_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { sweeper.run(cancel).await })
    };

    let mut report = tokio::time::interval(HEALTH_REPORT_INTERVAL);
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            () = &mut shutdown => break,
            _ = report.tick() => {
                let health = handle.health();
                if health.is_healthy() {
                    debug!(stats = ?handle.stats(), "cleanup healthy");
                } else {
                    error!(health = ?health, stats = ?handle.stats(), "cleanup unhealthy: metadata store unreachable");
                }
            }
        }
    }

    info!("shutdown requested");
    cancel.cancel();
    if let Err(e) = sweeper_task.await {
        warn!(error = %e, "stale job sweeper task failed");
    }
    Ok(handle.shutdown().await)
}

#[cfg(test)]
mod tests {
    use super::*;

    use jobsweep_core::{JobId, JobStatus, ManualClock, StatusUpdate};
    use jobsweep_infra::config::MetadataStoreConfig;
    use jobsweep_infra::metadata_store::{InMemoryMetadataStore, UpdateOutcome};

    #[tokio::test]
    async fn serve_repairs_stale_jobs_and_stops_on_shutdown() {
        let mut config = CleanupConfig::new(MetadataStoreConfig::new("memory://", "job_metadata"));
        config.staleness_threshold = Duration::from_secs(60);
        config.sweep_interval = Duration::from_millis(20);
        config.poll_wait = Duration::from_millis(10);
        config.workers = 2;

        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryMetadataStore::with_clock(clock.clone()));
        let id = JobId::new("J1").unwrap();
        let created = store.create(&id).await.unwrap();
        let UpdateOutcome::Updated(_) = store
            .conditional_update(&id, created.version, StatusUpdate::to(JobStatus::EnqueuePending))
            .await
            .unwrap()
        else {
            panic!("pending transition must succeed");
        };
        clock.advance(Duration::from_secs(61));

        let feed = Arc::new(InMemoryChangeFeed::new());
        let watched = store.clone();
        let shutdown = async move {
            for _ in 0..400 {
                let status = watched.get(&JobId::new("J1").unwrap()).await.unwrap().unwrap().status;
                if status == JobStatus::FinishedFailed {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };

        let stats = serve(&config, store.clone(), feed, clock, shutdown).await.unwrap();

        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::FinishedFailed);
        assert_eq!(stats.permanent_failures, 0);
    }
}
