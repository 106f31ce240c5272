//! Change-event dispatcher.
//!
//! ## Design
//!
//! - A pool of `workers` tasks pulls batches from a [`ChangeSource`]
//! - Each event is offered to every registered handler concurrently (fan-out);
//!   one handler's outcome never affects another's
//! - `Retryable` outcomes are retried per (event, handler) pair with backoff
//!   until the retry budget is spent, then recorded as permanent failures
//! - An event is acknowledged only after every pair has resolved
//!   (Handled, Skipped or permanently failed)
//! - Fully resolved event ids are remembered so exact redeliveries are
//!   acknowledged without running handlers again
//!
//! Per-record consistency is not the dispatcher's concern: the metadata store's
//! version check arbitrates between concurrent writers.

pub mod dedup;
pub mod retry;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use jobsweep_core::{EventId, JobId};
use jobsweep_events::{
    ChangeEvent, ChangeHandler, ChangeSource, Delivery, HandlerError, HandlerOutcome,
};

use crate::delivery_failures::{DeliveryFailureSink, LoggingDeliveryFailures, PermanentDeliveryFailure};
use crate::handlers::HandlerRegistry;

pub use dedup::SeenEvents;
pub use retry::{Backoff, RetryPolicy, pair_seed};

#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherConfig {
    /// Name for logging
    pub name: String,
    pub workers: usize,
    /// Maximum deliveries pulled per receive call
    pub batch_size: usize,
    /// How long one receive call waits for the first delivery
    pub poll_wait: Duration,
    pub retry: RetryPolicy,
    /// How long shutdown waits for in-flight deliveries before aborting them
    pub shutdown_grace: Duration,
    pub dedup_capacity: usize,
    /// Consecutive store-unavailable permanent failures that flip health
    pub unhealthy_after: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            name: "change-dispatcher".to_string(),
            workers: 4,
            batch_size: 16,
            poll_wait: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            shutdown_grace: Duration::from_secs(30),
            dedup_capacity: 10_000,
            unhealthy_after: 5,
        }
    }
}

impl DispatcherConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// How one (event, handler) pair resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairResolution {
    Handled,
    Skipped,
    PermanentlyFailed(Box<PermanentDeliveryFailure>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerReport {
    pub handler: String,
    pub attempts: u32,
    pub resolution: PairResolution,
}

/// Resolution of every handler for one event, in registration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub event_id: EventId,
    pub job_id: JobId,
    pub handlers: Vec<HandlerReport>,
}

impl DeliveryReport {
    pub fn resolution_of(&self, handler: &str) -> Option<&PairResolution> {
        self.handlers
            .iter()
            .find(|r| r.handler == handler)
            .map(|r| &r.resolution)
    }

    pub fn permanent_failures(&self) -> impl Iterator<Item = &PermanentDeliveryFailure> {
        self.handlers.iter().filter_map(|r| match &r.resolution {
            PairResolution::PermanentlyFailed(failure) => Some(failure.as_ref()),
            _ => None,
        })
    }

    pub fn is_clean(&self) -> bool {
        self.permanent_failures().next().is_none()
    }
}

/// Dispatcher runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub events_received: u64,
    pub events_acknowledged: u64,
    pub duplicates_skipped: u64,
    pub handled: u64,
    pub skipped: u64,
    pub retries: u64,
    pub permanent_failures: u64,
    pub receive_errors: u64,
    pub ack_errors: u64,
    pub in_flight: usize,
}

/// Process-level health signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Health {
    Healthy,
    /// The metadata store has been unreachable for this many consecutive
    /// permanent failures.
    Unhealthy { consecutive_unavailable: u32 },
}

impl Health {
    pub fn is_healthy(self) -> bool {
        matches!(self, Health::Healthy)
    }
}

#[derive(Debug, Default)]
struct Counters {
    stats: DispatcherStats,
    consecutive_unavailable: u32,
}

/// Fan-out dispatcher over a [`HandlerRegistry`].
pub struct Dispatcher {
    registry: HandlerRegistry,
    config: DispatcherConfig,
    failures: Arc<dyn DeliveryFailureSink>,
    seen: SeenEvents,
    counters: Mutex<Counters>,
}

impl Dispatcher {
    pub fn new(registry: HandlerRegistry, config: DispatcherConfig) -> Self {
        Self {
            seen: SeenEvents::new(config.dedup_capacity),
            registry,
            config,
            failures: Arc::new(LoggingDeliveryFailures),
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn with_failure_sink(mut self, sink: Arc<dyn DeliveryFailureSink>) -> Self {
        self.failures = sink;
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn stats(&self) -> DispatcherStats {
        self.counters
            .lock()
            .map(|c| c.stats.clone())
            .unwrap_or_default()
    }

    pub fn health(&self) -> Health {
        let consecutive_unavailable = self
            .counters
            .lock()
            .map(|c| c.consecutive_unavailable)
            .unwrap_or(0);
        if self.config.unhealthy_after > 0 && consecutive_unavailable >= self.config.unhealthy_after
        {
            Health::Unhealthy {
                consecutive_unavailable,
            }
        } else {
            Health::Healthy
        }
    }

    fn update(&self, f: impl FnOnce(&mut Counters)) {
        let mut counters = self.counters.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut counters);
    }

    /// Offer `event` to every handler and wait until every pair has resolved.
    pub async fn deliver(&self, event: &ChangeEvent) -> DeliveryReport {
        let handlers = self.registry.handlers();
        let mut slots: Vec<Option<(u32, HandlerOutcome)>> = vec![None; handlers.len()];

        let mut set = JoinSet::new();
        for (idx, handler) in handlers.iter().enumerate() {
            let handler = Arc::clone(handler);
            let event = event.clone();
            let retry = self.config.retry.clone();
            set.spawn(async move { (idx, run_pair(handler.as_ref(), &event, &retry).await) });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, resolved)) => slots[idx] = Some(resolved),
                Err(err) if err.is_panic() => {
                    error!(event_id = %event.event_id(), "change handler panicked");
                }
                Err(err) => {
                    warn!(event_id = %event.event_id(), error = %err, "change handler task cancelled");
                }
            }
        }

        let reports = handlers
            .iter()
            .zip(slots)
            .map(|(handler, slot)| self.resolve(event, handler.as_ref(), slot))
            .collect();

        DeliveryReport {
            event_id: event.event_id(),
            job_id: event.job_id().clone(),
            handlers: reports,
        }
    }

    fn resolve(
        &self,
        event: &ChangeEvent,
        handler: &dyn ChangeHandler,
        slot: Option<(u32, HandlerOutcome)>,
    ) -> HandlerReport {
        // A missing slot means the handler task panicked.
        let (attempts, outcome) = slot.unwrap_or_else(|| {
            (1, HandlerOutcome::Retryable(HandlerError::other("handler panicked")))
        });

        let resolution = match outcome {
            HandlerOutcome::Handled => PairResolution::Handled,
            HandlerOutcome::Skipped => PairResolution::Skipped,
            HandlerOutcome::Retryable(last_error) => {
                let failure = PermanentDeliveryFailure {
                    event: event.clone(),
                    handler: handler.name().to_string(),
                    attempts,
                    last_error,
                    failed_at: Utc::now(),
                };
                self.failures.record(&failure);
                PairResolution::PermanentlyFailed(Box::new(failure))
            }
        };

        self.update(|c| {
            c.stats.retries += u64::from(attempts.saturating_sub(1));
            match &resolution {
                PairResolution::Handled => {
                    c.stats.handled += 1;
                    c.consecutive_unavailable = 0;
                }
                PairResolution::Skipped => {
                    c.stats.skipped += 1;
                    c.consecutive_unavailable = 0;
                }
                PairResolution::PermanentlyFailed(failure) => {
                    c.stats.permanent_failures += 1;
                    if failure.store_unavailable() {
                        c.consecutive_unavailable += 1;
                    }
                }
            }
        });

        HandlerReport {
            handler: handler.name().to_string(),
            attempts,
            resolution,
        }
    }

    /// Deliver one received event and acknowledge it once resolved.
    pub async fn process<S>(&self, source: &S, delivery: Delivery) -> Option<DeliveryReport>
    where
        S: ChangeSource + ?Sized,
    {
        let event_id = delivery.event.event_id();
        self.update(|c| c.stats.events_received += 1);

        let report = if self.seen.contains(event_id) {
            debug!(dispatcher = %self.config.name, event_id = %event_id, "duplicate delivery, acknowledging");
            self.update(|c| c.stats.duplicates_skipped += 1);
            None
        } else {
            self.update(|c| c.stats.in_flight += 1);
            let report = self.deliver(&delivery.event).await;
            self.update(|c| c.stats.in_flight = c.stats.in_flight.saturating_sub(1));
            if report.is_clean() {
                self.seen.insert(event_id);
            }
            Some(report)
        };

        match source.acknowledge(&delivery.receipt).await {
            Ok(()) => self.update(|c| c.stats.events_acknowledged += 1),
            Err(err) => {
                warn!(
                    dispatcher = %self.config.name,
                    event_id = %event_id,
                    receipt = %delivery.receipt,
                    error = %err,
                    "failed to acknowledge delivery"
                );
                self.update(|c| c.stats.ack_errors += 1);
            }
        }

        report
    }

    /// Start the worker pool.
    pub fn spawn<S>(self, source: Arc<S>) -> DispatcherHandle
    where
        S: ChangeSource + 'static,
    {
        let dispatcher = Arc::new(self);
        let intake = CancellationToken::new();
        let abort = CancellationToken::new();

        let mut workers = JoinSet::new();
        for worker in 0..dispatcher.config.workers.max(1) {
            workers.spawn(worker_loop(
                Arc::clone(&dispatcher),
                Arc::clone(&source),
                worker,
                intake.clone(),
                abort.clone(),
            ));
        }

        info!(
            dispatcher = %dispatcher.config.name,
            workers = dispatcher.config.workers.max(1),
            handlers = ?dispatcher.registry.names(),
            "dispatcher started"
        );

        DispatcherHandle {
            dispatcher,
            intake,
            abort,
            workers,
        }
    }
}

/// Run one (event, handler) pair until it resolves or the budget is spent.
///
/// Returns the number of attempts made and the final outcome.
async fn run_pair(
    handler: &dyn ChangeHandler,
    event: &ChangeEvent,
    retry: &RetryPolicy,
) -> (u32, HandlerOutcome) {
    let seed = pair_seed(event.event_id(), handler.name());
    let mut attempt = 0;
    loop {
        attempt += 1;
        let outcome = handler.handle(event).await;
        let HandlerOutcome::Retryable(err) = &outcome else {
            return (attempt, outcome);
        };

        if !retry.should_retry(attempt) {
            return (attempt, outcome);
        }

        let delay = retry.delay_for(attempt, seed);
        debug!(
            handler = handler.name(),
            event_id = %event.event_id(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying change handler"
        );
        tokio::time::sleep(delay).await;
    }
}

async fn worker_loop<S>(
    dispatcher: Arc<Dispatcher>,
    source: Arc<S>,
    worker: usize,
    intake: CancellationToken,
    abort: CancellationToken,
) where
    S: ChangeSource + 'static,
{
    let name = dispatcher.config.name.clone();
    debug!(dispatcher = %name, worker, "dispatcher worker started");

    'intake: loop {
        let received = tokio::select! {
            _ = intake.cancelled() => break,
            received = source.receive(dispatcher.config.batch_size, dispatcher.config.poll_wait) => received,
        };

        let batch = match received {
            Ok(batch) => batch,
            Err(err) => {
                error!(dispatcher = %name, worker, error = %err, "failed to receive change events");
                dispatcher.update(|c| c.stats.receive_errors += 1);
                let stopped = tokio::select! {
                    _ = intake.cancelled() => true,
                    _ = tokio::time::sleep(dispatcher.config.poll_wait) => false,
                };
                if stopped {
                    break;
                }
                continue;
            }
        };

        for delivery in batch {
            // Unstarted deliveries stay unacknowledged and are redelivered later.
            if intake.is_cancelled() {
                break 'intake;
            }
            let event_id = delivery.event.event_id();
            tokio::select! {
                _ = abort.cancelled() => {
                    warn!(dispatcher = %name, worker, event_id = %event_id, "delivery abandoned at shutdown");
                    break 'intake;
                }
                _ = dispatcher.process(source.as_ref(), delivery) => {}
            }
        }
    }

    debug!(dispatcher = %name, worker, "dispatcher worker stopped");
}

/// Handle to a running dispatcher.
pub struct DispatcherHandle {
    dispatcher: Arc<Dispatcher>,
    intake: CancellationToken,
    abort: CancellationToken,
    workers: JoinSet<()>,
}

impl DispatcherHandle {
    pub fn stats(&self) -> DispatcherStats {
        self.dispatcher.stats()
    }

    pub fn health(&self) -> Health {
        self.dispatcher.health()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Stop intake, let in-flight deliveries finish within the grace period,
    /// then abandon whatever is left (unacknowledged).
    pub async fn shutdown(mut self) -> DispatcherStats {
        let name = self.dispatcher.config.name.clone();
        let grace = self.dispatcher.config.shutdown_grace;
        self.intake.cancel();

        let drained = tokio::time::timeout(grace, drain(&mut self.workers)).await;
        if drained.is_err() {
            warn!(dispatcher = %name, grace_ms = grace.as_millis() as u64, "shutdown grace expired, aborting in-flight deliveries");
            self.abort.cancel();
            drain(&mut self.workers).await;
        }

        let stats = self.dispatcher.stats();
        info!(dispatcher = %name, stats = ?stats, "dispatcher stopped");
        stats
    }
}

async fn drain(workers: &mut JoinSet<()>) {
    while let Some(joined) = workers.join_next().await {
        if let Err(err) = joined {
            error!(error = %err, "dispatcher worker failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use async_trait::async_trait;
    use jobsweep_core::{JobMetadata, JobStatus};
    use jobsweep_events::{ChangeKind, ChangePublisher, InMemoryChangeFeed};

    use crate::delivery_failures::InMemoryDeliveryFailures;

    /// Returns the scripted outcomes in order, then repeats the last one.
    struct Scripted {
        name: &'static str,
        outcomes: Vec<HandlerOutcome>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(name: &'static str, outcomes: Vec<HandlerOutcome>) -> Arc<Self> {
            Arc::new(Self {
                name,
                outcomes,
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChangeHandler for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        async fn handle(&self, _event: &ChangeEvent) -> HandlerOutcome {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            self.outcomes[n.min(self.outcomes.len() - 1)].clone()
        }
    }

    struct Panics;

    #[async_trait]
    impl ChangeHandler for Panics {
        fn name(&self) -> &str {
            "panics"
        }

        async fn handle(&self, _event: &ChangeEvent) -> HandlerOutcome {
            panic!("boom");
        }
    }

    /// Never returns once started.
    #[derive(Default)]
    struct Stuck {
        started: AtomicBool,
    }

    #[async_trait]
    impl ChangeHandler for Stuck {
        fn name(&self) -> &str {
            "stuck"
        }

        async fn handle(&self, _event: &ChangeEvent) -> HandlerOutcome {
            self.started.store(true, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    fn event(id: &str) -> ChangeEvent {
        let mut record = JobMetadata::new(JobId::new(id).unwrap(), Utc::now());
        record.status = JobStatus::EnqueuePending;
        ChangeEvent::from_snapshot(ChangeKind::Modify, &record, Utc::now())
    }

    fn unavailable() -> HandlerOutcome {
        HandlerOutcome::Retryable(HandlerError::Unavailable("down".into()))
    }

    fn config() -> DispatcherConfig {
        DispatcherConfig::default()
            .with_retry(RetryPolicy::fixed(3, Duration::from_millis(1)))
            .with_workers(2)
    }

    #[tokio::test]
    async fn fans_out_and_isolates_handler_failures() {
        let ok = Scripted::new("ok", vec![HandlerOutcome::Handled]);
        let flaky = Scripted::new("flaky", vec![unavailable(), HandlerOutcome::Skipped]);
        let broken = Scripted::new("broken", vec![unavailable()]);
        let failures = Arc::new(InMemoryDeliveryFailures::new());

        let registry = HandlerRegistry::new()
            .with(ok.clone())
            .unwrap()
            .with(flaky.clone())
            .unwrap()
            .with(broken.clone())
            .unwrap();
        let dispatcher = Dispatcher::new(registry, config()).with_failure_sink(failures.clone());

        let report = dispatcher.deliver(&event("J1")).await;

        assert_eq!(report.resolution_of("ok"), Some(&PairResolution::Handled));
        assert_eq!(report.resolution_of("flaky"), Some(&PairResolution::Skipped));
        assert!(matches!(
            report.resolution_of("broken"),
            Some(PairResolution::PermanentlyFailed(_))
        ));
        assert_eq!(ok.calls(), 1);
        assert_eq!(flaky.calls(), 2);
        assert_eq!(broken.calls(), 3);

        let recorded = failures.failures();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].handler, "broken");
        assert_eq!(recorded[0].attempts, 3);
        assert!(recorded[0].store_unavailable());

        let stats = dispatcher.stats();
        assert_eq!(stats.handled, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.permanent_failures, 1);
        assert_eq!(stats.retries, 1 + 2);
    }

    #[tokio::test]
    async fn handler_panic_becomes_permanent_failure() {
        let ok = Scripted::new("ok", vec![HandlerOutcome::Handled]);
        let registry = HandlerRegistry::new()
            .with(Arc::new(Panics))
            .unwrap()
            .with(ok.clone())
            .unwrap();
        let dispatcher = Dispatcher::new(registry, config());

        let report = dispatcher.deliver(&event("J1")).await;
        assert!(matches!(
            report.resolution_of("panics"),
            Some(PairResolution::PermanentlyFailed(_))
        ));
        assert_eq!(report.resolution_of("ok"), Some(&PairResolution::Handled));
    }

    #[tokio::test]
    async fn health_flips_after_consecutive_unavailable_failures() {
        let broken = Scripted::new("broken", vec![unavailable()]);
        let mut cfg = config();
        cfg.unhealthy_after = 2;
        cfg.retry = RetryPolicy::no_retry();
        let dispatcher = Dispatcher::new(HandlerRegistry::new().with(broken).unwrap(), cfg);

        dispatcher.deliver(&event("J1")).await;
        assert!(dispatcher.health().is_healthy());
        dispatcher.deliver(&event("J2")).await;
        assert_eq!(
            dispatcher.health(),
            Health::Unhealthy {
                consecutive_unavailable: 2
            }
        );
    }

    #[tokio::test]
    async fn redelivered_event_is_acknowledged_without_rerunning_handlers() {
        let feed = Arc::new(InMemoryChangeFeed::new());
        let counting = Scripted::new("counting", vec![HandlerOutcome::Handled]);
        let dispatcher = Dispatcher::new(HandlerRegistry::new().with(counting.clone()).unwrap(), config());

        let original = event("J1");
        feed.publish(original.clone()).unwrap();
        feed.publish(original).unwrap();

        let batch = feed.receive(10, Duration::from_millis(10)).await.unwrap();
        for delivery in batch {
            dispatcher.process(feed.as_ref(), delivery).await;
        }

        assert_eq!(counting.calls(), 1);
        assert_eq!(feed.in_flight_len(), 0);
        let stats = dispatcher.stats();
        assert_eq!(stats.duplicates_skipped, 1);
        assert_eq!(stats.events_acknowledged, 2);
    }

    #[tokio::test]
    async fn spawned_pool_drains_feed_and_shuts_down() {
        let feed = Arc::new(InMemoryChangeFeed::new());
        let counting = Scripted::new("counting", vec![HandlerOutcome::Skipped]);
        let mut cfg = config();
        cfg.poll_wait = Duration::from_millis(10);
        let handle = Dispatcher::new(HandlerRegistry::new().with(counting.clone()).unwrap(), cfg)
            .spawn(feed.clone());

        for i in 0..20 {
            feed.publish(event(&format!("J{i}"))).unwrap();
        }

        for _ in 0..200 {
            if handle.stats().events_acknowledged == 20 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let stats = handle.shutdown().await;
        assert_eq!(stats.events_acknowledged, 20);
        assert_eq!(counting.calls(), 20);
        assert_eq!(feed.pending_len() + feed.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn shutdown_abandons_deliveries_still_running_after_the_grace_period() {
        let feed = Arc::new(InMemoryChangeFeed::new());
        let stuck = Arc::new(Stuck::default());
        let mut cfg = config().with_workers(1);
        cfg.poll_wait = Duration::from_millis(10);
        cfg.shutdown_grace = Duration::from_millis(50);
        let handle = Dispatcher::new(HandlerRegistry::new().with(stuck.clone()).unwrap(), cfg)
            .spawn(feed.clone());

        feed.publish(event("J1")).unwrap();
        for _ in 0..200 {
            if stuck.started.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(stuck.started.load(Ordering::SeqCst));

        let stats = tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .expect("shutdown must not wait on a stuck handler");

        assert_eq!(stats.events_acknowledged, 0);
        assert_eq!(feed.in_flight_len(), 1);
        assert_eq!(feed.pending_len(), 0);
    }
}
