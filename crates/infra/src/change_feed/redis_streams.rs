//! Redis Streams-backed change feed (durable, at-least-once delivery).
//!
//! - **Publish**: `XADD` one entry per change event
//! - **Consume**: `XREADGROUP` within one consumer group; every dispatcher
//!   worker reads as the same named consumer
//! - **Redelivery**: entries left unacknowledged for `claim_idle` are reclaimed
//!   with `XPENDING` + `XCLAIM`
//! - **Dead-letter**: entries delivered more than `max_deliveries` times, or
//!   entries that cannot be decoded, move to the dead-letter stream and are
//!   acknowledged on the main stream
//!
//! The `redis` client here is synchronous; async callers run it on the blocking
//! pool.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamRangeReply, StreamReadReply,
};
use tracing::{debug, instrument, warn};

use jobsweep_events::{ChangeEvent, ChangePublisher, ChangeSource, Delivery, DeliveryReceipt};

use crate::config::ChangeStreamConfig;

#[derive(Debug, thiserror::Error)]
pub enum RedisStreamsError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("blocking task failed: {0}")]
    Join(String),
}

#[derive(Debug, Clone)]
pub struct RedisStreamsChangeFeed {
    client: Arc<redis::Client>,
    config: ChangeStreamConfig,
}

impl RedisStreamsChangeFeed {
    pub fn new(config: ChangeStreamConfig) -> Result<Self, RedisStreamsError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
            config,
        })
    }

    fn connection(&self) -> Result<redis::Connection, RedisStreamsError> {
        self.client
            .get_connection()
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))
    }

    /// Create the consumer group (and the stream) if missing.
    pub fn ensure_consumer_group(&self) -> Result<(), RedisStreamsError> {
        let mut conn = self.connection()?;
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.stream)
            .arg(&self.config.group)
            .arg("0")
            .arg("MKSTREAM")
            .query(&mut conn);

        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(RedisStreamsError::Command(format!("XGROUP CREATE failed: {e}"))),
        }
    }

    #[instrument(skip_all, fields(stream = %self.config.stream, job_id = %event.job_id()), err)]
    fn publish_sync(&self, event: &ChangeEvent) -> Result<(), RedisStreamsError> {
        let payload = event
            .to_json()
            .map_err(|e| RedisStreamsError::Serialization(e.to_string()))?;
        let mut conn = self.connection()?;

        let _: String = redis::cmd("XADD")
            .arg(&self.config.stream)
            .arg("*")
            .arg("event_id")
            .arg(event.event_id().to_string())
            .arg("job_id")
            .arg(event.job_id().as_str())
            .arg("payload")
            .arg(&payload)
            .query(&mut conn)
            .map_err(|e| RedisStreamsError::Command(format!("XADD failed: {e}")))?;
        Ok(())
    }

    fn receive_sync(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>, RedisStreamsError> {
        let mut conn = self.connection()?;

        let reclaimed = self.reclaim_idle(&mut conn, max)?;
        if !reclaimed.is_empty() {
            return Ok(reclaimed);
        }

        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.group)
            .arg(&self.config.consumer)
            .arg("COUNT")
            .arg(max)
            .arg("BLOCK")
            .arg(block_millis(wait))
            .arg("STREAMS")
            .arg(&self.config.stream)
            .arg(">")
            .query(&mut conn)
            .map_err(|e| RedisStreamsError::Command(format!("XREADGROUP failed: {e}")))?;

        let entries = reply
            .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect::<Vec<_>>())
            .unwrap_or_default();
        self.decode_all(&mut conn, entries)
    }

    /// Claim entries idle longer than `claim_idle`, dead-lettering the ones
    /// that were delivered too often.
    fn reclaim_idle(
        &self,
        conn: &mut redis::Connection,
        max: usize,
    ) -> Result<Vec<Delivery>, RedisStreamsError> {
        let idle_ms = self.config.claim_idle.as_millis() as u64;
        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.config.stream)
            .arg(&self.config.group)
            .arg("IDLE")
            .arg(idle_ms)
            .arg("-")
            .arg("+")
            .arg(max)
            .query(conn)
            .map_err(|e| RedisStreamsError::Command(format!("XPENDING failed: {e}")))?;

        let mut to_claim = Vec::new();
        for entry in pending.ids {
            if entry.times_delivered > self.config.max_deliveries as usize {
                self.dead_letter_by_id(conn, &entry.id, entry.times_delivered)?;
            } else {
                to_claim.push(entry.id);
            }
        }
        if to_claim.is_empty() {
            return Ok(Vec::new());
        }

        let claimed: StreamClaimReply = redis::cmd("XCLAIM")
            .arg(&self.config.stream)
            .arg(&self.config.group)
            .arg(&self.config.consumer)
            .arg(idle_ms)
            .arg(&to_claim[..])
            .query(conn)
            .map_err(|e| RedisStreamsError::Command(format!("XCLAIM failed: {e}")))?;

        debug!(claimed = claimed.ids.len(), "reclaimed idle change events");
        self.decode_all(conn, claimed.ids)
    }

    fn decode_all(
        &self,
        conn: &mut redis::Connection,
        entries: Vec<StreamId>,
    ) -> Result<Vec<Delivery>, RedisStreamsError> {
        let mut deliveries = Vec::with_capacity(entries.len());
        for entry in entries {
            let payload: Option<String> = entry.get("payload");
            match payload.as_deref().map(ChangeEvent::from_json) {
                Some(Ok(event)) => {
                    deliveries.push(Delivery::new(event, DeliveryReceipt::new(entry.id)));
                }
                Some(Err(e)) => {
                    self.dead_letter(conn, &entry.id, payload.as_deref().unwrap_or(""), &e.to_string())?;
                }
                None => self.dead_letter(conn, &entry.id, "", "missing payload field")?,
            }
        }
        Ok(deliveries)
    }

    fn dead_letter_by_id(
        &self,
        conn: &mut redis::Connection,
        id: &str,
        times_delivered: usize,
    ) -> Result<(), RedisStreamsError> {
        let entries: StreamRangeReply = redis::cmd("XRANGE")
            .arg(&self.config.stream)
            .arg(id)
            .arg(id)
            .query(conn)
            .map_err(|e| RedisStreamsError::Command(format!("XRANGE failed: {e}")))?;
        let payload: String = entries
            .ids
            .first()
            .and_then(|entry| entry.get("payload"))
            .unwrap_or_default();
        self.dead_letter(
            conn,
            id,
            &payload,
            &format!("delivered {times_delivered} times without acknowledgement"),
        )
    }

    fn dead_letter(
        &self,
        conn: &mut redis::Connection,
        id: &str,
        payload: &str,
        reason: &str,
    ) -> Result<(), RedisStreamsError> {
        let _: String = redis::cmd("XADD")
            .arg(&self.config.dead_letter_stream)
            .arg("*")
            .arg("original_message_id")
            .arg(id)
            .arg("reason")
            .arg(reason)
            .arg("failed_at")
            .arg(chrono::Utc::now().to_rfc3339())
            .arg("payload")
            .arg(payload)
            .query(conn)
            .map_err(|e| RedisStreamsError::Command(format!("DLQ XADD failed: {e}")))?;
        self.ack_ids(conn, &[id.to_string()])?;

        warn!(message_id = %id, reason, "change event moved to dead-letter stream");
        Ok(())
    }

    fn ack_ids(&self, conn: &mut redis::Connection, ids: &[String]) -> Result<(), RedisStreamsError> {
        let _: u64 = redis::cmd("XACK")
            .arg(&self.config.stream)
            .arg(&self.config.group)
            .arg(ids)
            .query(conn)
            .map_err(|e| RedisStreamsError::Command(format!("XACK failed: {e}")))?;
        Ok(())
    }
}

/// `BLOCK 0` waits forever; clamp to at least one millisecond.
fn block_millis(wait: Duration) -> u64 {
    (wait.as_millis() as u64).max(1)
}

impl ChangePublisher for RedisStreamsChangeFeed {
    type Error = RedisStreamsError;

    fn publish(&self, event: ChangeEvent) -> Result<(), Self::Error> {
        self.publish_sync(&event)
    }
}

#[async_trait]
impl ChangeSource for RedisStreamsChangeFeed {
    type Error = RedisStreamsError;

    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>, Self::Error> {
        let feed = self.clone();
        tokio::task::spawn_blocking(move || feed.receive_sync(max, wait))
            .await
            .map_err(|e| RedisStreamsError::Join(e.to_string()))?
    }

    async fn acknowledge(&self, receipt: &DeliveryReceipt) -> Result<(), Self::Error> {
        let feed = self.clone();
        let id = receipt.as_str().to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = feed.connection()?;
            feed.ack_ids(&mut conn, &[id])
        })
        .await
        .map_err(|e| RedisStreamsError::Join(e.to_string()))?
    }
}
