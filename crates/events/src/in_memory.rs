//! In-memory change feed for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::ChangeEvent;
use crate::source::{ChangePublisher, ChangeSource, Delivery, DeliveryReceipt};

#[derive(Debug, thiserror::Error)]
pub enum InMemoryFeedError {
    /// Internal lock poisoning.
    #[error("change feed lock poisoned")]
    Poisoned,

    #[error("unknown delivery receipt: {0}")]
    UnknownReceipt(DeliveryReceipt),
}

#[derive(Debug, Default)]
struct FeedState {
    pending: VecDeque<ChangeEvent>,
    in_flight: HashMap<DeliveryReceipt, ChangeEvent>,
    next_receipt: u64,
    published: u64,
}

/// In-memory change stream.
///
/// - No IO
/// - Competing consumers: each pending event goes to exactly one `receive` call
/// - Received events stay in flight until acknowledged;
///   [`InMemoryChangeFeed::redeliver_unacknowledged`] plays the role of a
///   visibility timeout
/// - Publishing the same event twice models a duplicate delivery
#[derive(Debug, Default)]
pub struct InMemoryChangeFeed {
    state: Mutex<FeedState>,
    ready: Notify,
}

impl InMemoryChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return every in-flight delivery to the front of the queue.
    ///
    /// Returns how many deliveries were released.
    pub fn redeliver_unacknowledged(&self) -> Result<usize, InMemoryFeedError> {
        let released = {
            let mut state = self.state.lock().map_err(|_| InMemoryFeedError::Poisoned)?;
            let in_flight: Vec<ChangeEvent> = state.in_flight.drain().map(|(_, e)| e).collect();
            let released = in_flight.len();
            for event in in_flight {
                state.pending.push_front(event);
            }
            released
        };

        if released > 0 {
            self.ready.notify_one();
        }
        Ok(released)
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().map(|s| s.pending.len()).unwrap_or(0)
    }

    pub fn in_flight_len(&self) -> usize {
        self.state.lock().map(|s| s.in_flight.len()).unwrap_or(0)
    }

    /// Total number of events ever published.
    pub fn published_count(&self) -> u64 {
        self.state.lock().map(|s| s.published).unwrap_or(0)
    }

    fn take(&self, max: usize) -> Result<Vec<Delivery>, InMemoryFeedError> {
        let mut state = self.state.lock().map_err(|_| InMemoryFeedError::Poisoned)?;
        let mut batch = Vec::new();

        while batch.len() < max {
            let Some(event) = state.pending.pop_front() else {
                break;
            };
            state.next_receipt += 1;
            let receipt = DeliveryReceipt::new(format!("mem-{}", state.next_receipt));
            state.in_flight.insert(receipt.clone(), event.clone());
            batch.push(Delivery::new(event, receipt));
        }

        Ok(batch)
    }
}

impl ChangePublisher for InMemoryChangeFeed {
    type Error = InMemoryFeedError;

    fn publish(&self, event: ChangeEvent) -> Result<(), Self::Error> {
        {
            let mut state = self.state.lock().map_err(|_| InMemoryFeedError::Poisoned)?;
            state.pending.push_back(event);
            state.published += 1;
        }
        self.ready.notify_one();
        Ok(())
    }
}

#[async_trait]
impl ChangeSource for InMemoryChangeFeed {
    type Error = InMemoryFeedError;

    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>, Self::Error> {
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            // Register interest before checking so a concurrent publish is not missed.
            let notified = self.ready.notified();

            let batch = self.take(max)?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn acknowledge(&self, receipt: &DeliveryReceipt) -> Result<(), Self::Error> {
        let mut state = self.state.lock().map_err(|_| InMemoryFeedError::Poisoned)?;
        state
            .in_flight
            .remove(receipt)
            .map(|_| ())
            .ok_or_else(|| InMemoryFeedError::UnknownReceipt(receipt.clone()))
    }
}
