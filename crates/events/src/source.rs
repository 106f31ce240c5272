//! Change-stream publishing and consumption (mechanics only).
//!
//! ## Delivery model
//!
//! - **At-least-once**: a change may be delivered more than once; every handler
//!   must be idempotent
//! - **No ordering guarantees** across records; changes to the same record may
//!   also arrive out of order
//! - **Explicit acknowledgement**: a delivery stays outstanding until the
//!   consumer acknowledges its receipt. Unacknowledged deliveries become
//!   eligible for redelivery (visibility timeout, consumer crash, ...)
//!
//! The store is the source of truth; the stream only tells consumers that a
//! record changed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::ChangeEvent;

/// Opaque token identifying one delivery of a change event.
///
/// Two deliveries of the same event carry different receipts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryReceipt(String);

impl DeliveryReceipt {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for DeliveryReceipt {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A change event handed to a consumer, plus the receipt used to acknowledge it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub event: ChangeEvent,
    pub receipt: DeliveryReceipt,
}

impl Delivery {
    pub fn new(event: ChangeEvent, receipt: DeliveryReceipt) -> Self {
        Self { event, receipt }
    }
}

/// Write side of the change stream (the store's change-capture hook).
///
/// Synchronous and cheap: implementations append to a buffer or issue one
/// network write.
pub trait ChangePublisher: Send + Sync {
    type Error: core::fmt::Debug + core::fmt::Display + Send + Sync + 'static;

    fn publish(&self, event: ChangeEvent) -> Result<(), Self::Error>;
}

impl<P> ChangePublisher for Arc<P>
where
    P: ChangePublisher + ?Sized,
{
    type Error = P::Error;

    fn publish(&self, event: ChangeEvent) -> Result<(), Self::Error> {
        (**self).publish(event)
    }
}

/// Read side of the change stream.
///
/// ```text
/// MetadataStore write -> ChangePublisher -> stream -> ChangeSource -> Dispatcher
///                                                         ^              |
///                                                         +-- acknowledge+
/// ```
///
/// Consumers must call [`ChangeSource::acknowledge`] only once the delivery is
/// fully resolved; acknowledging earlier would turn at-least-once into
/// at-most-once.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    type Error: core::fmt::Debug + core::fmt::Display + Send + Sync + 'static;

    /// Receive up to `max` deliveries, waiting at most `wait` for the first one.
    ///
    /// Returns an empty batch when nothing arrived in time.
    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>, Self::Error>;

    /// Mark a delivery as processed so it is never redelivered.
    async fn acknowledge(&self, receipt: &DeliveryReceipt) -> Result<(), Self::Error>;
}

#[async_trait]
impl<S> ChangeSource for Arc<S>
where
    S: ChangeSource + ?Sized,
{
    type Error = S::Error;

    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>, Self::Error> {
        (**self).receive(max, wait).await
    }

    async fn acknowledge(&self, receipt: &DeliveryReceipt) -> Result<(), Self::Error> {
        (**self).acknowledge(receipt).await
    }
}
