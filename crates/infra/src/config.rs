//! Runtime configuration of the cleanup subsystem.
//!
//! Plain structures handed to constructors at startup. Loading them (from the
//! environment or elsewhere) is the binary's job.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dispatcher::{DispatcherConfig, RetryPolicy};
use crate::handlers::MarkFailedToEnqueueConfig;
use crate::metadata_store::postgres::is_valid_table_name;
use crate::sweeper::SweeperConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Where the job metadata lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataStoreConfig {
    /// Connection URL of the backing database.
    pub endpoint: String,
    /// Deployment region, recorded for logs.
    pub region: String,
    pub table_name: String,
    pub max_connections: u32,
}

impl MetadataStoreConfig {
    pub fn new(endpoint: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            region: "local".to_string(),
            table_name: table_name.into(),
            max_connections: 10,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }
}

/// Durable change stream (Redis Streams) settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeStreamConfig {
    pub url: String,
    pub stream: String,
    pub group: String,
    pub consumer: String,
    /// Deliveries unacknowledged for this long are reclaimed.
    pub claim_idle: Duration,
    /// Deliveries of one entry before it is moved to the dead-letter stream.
    pub max_deliveries: u32,
    pub dead_letter_stream: String,
}

impl ChangeStreamConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            stream: "jobsweep:job-metadata-changes".to_string(),
            group: "jobsweep-cleanup".to_string(),
            consumer: "cleanup-1".to_string(),
            claim_idle: Duration::from_secs(60),
            max_deliveries: 16,
            dead_letter_stream: "jobsweep:job-metadata-changes:dlq".to_string(),
        }
    }
}

/// Full configuration of the failed-enqueue cleanup process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupConfig {
    pub metadata_store: MetadataStoreConfig,
    /// Total attempts per (event, handler) pair before a permanent failure.
    pub retry_budget: u32,
    /// How long a job may sit in ENQUEUE_PENDING before it is failed.
    pub staleness_threshold: Duration,
    /// Per-call timeout for metadata store round trips.
    pub call_timeout: Duration,
    /// Re-evaluations after a version conflict.
    pub conflict_retries: u32,
    pub workers: usize,
    pub batch_size: usize,
    pub poll_wait: Duration,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub shutdown_grace: Duration,
    pub sweep_interval: Duration,
    pub dedup_capacity: usize,
    /// Consecutive store-unavailable permanent failures before reporting unhealthy.
    pub unhealthy_after: u32,
    pub change_stream: Option<ChangeStreamConfig>,
}

impl CleanupConfig {
    pub fn new(metadata_store: MetadataStoreConfig) -> Self {
        Self {
            metadata_store,
            retry_budget: 3,
            staleness_threshold: Duration::from_secs(300),
            call_timeout: Duration::from_secs(5),
            conflict_retries: 3,
            workers: 4,
            batch_size: 16,
            poll_wait: Duration::from_secs(1),
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60),
            dedup_capacity: 10_000,
            unhealthy_after: 5,
            change_stream: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.metadata_store.endpoint.trim().is_empty() {
            return Err(ConfigError::Missing("metadata_store.endpoint"));
        }
        if !is_valid_table_name(&self.metadata_store.table_name) {
            return Err(ConfigError::invalid(
                "metadata_store.table_name",
                format!("'{}' is not a plain SQL identifier", self.metadata_store.table_name),
            ));
        }
        if self.metadata_store.max_connections == 0 {
            return Err(ConfigError::invalid("metadata_store.max_connections", "must be > 0"));
        }
        if self.retry_budget == 0 {
            return Err(ConfigError::invalid("retry_budget", "must allow at least one attempt"));
        }
        if self.staleness_threshold.is_zero() {
            return Err(ConfigError::invalid("staleness_threshold", "must be > 0"));
        }
        if self.call_timeout.is_zero() {
            return Err(ConfigError::invalid("call_timeout", "must be > 0"));
        }
        if self.workers == 0 {
            return Err(ConfigError::invalid("workers", "must be > 0"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("batch_size", "must be > 0"));
        }
        if self.base_backoff > self.max_backoff {
            return Err(ConfigError::invalid(
                "base_backoff",
                "must not exceed max_backoff",
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::invalid("sweep_interval", "must be > 0"));
        }
        if let Some(stream) = &self.change_stream {
            if stream.url.trim().is_empty() {
                return Err(ConfigError::Missing("change_stream.url"));
            }
            if stream.max_deliveries == 0 {
                return Err(ConfigError::invalid("change_stream.max_deliveries", "must be > 0"));
            }
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.retry_budget, self.base_backoff, self.max_backoff)
    }

    pub fn handler_config(&self) -> MarkFailedToEnqueueConfig {
        MarkFailedToEnqueueConfig {
            staleness_threshold: self.staleness_threshold,
            call_timeout: self.call_timeout,
            conflict_retries: self.conflict_retries,
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            name: "failed-enqueue-cleanup".to_string(),
            workers: self.workers,
            batch_size: self.batch_size,
            poll_wait: self.poll_wait,
            retry: self.retry_policy(),
            shutdown_grace: self.shutdown_grace,
            dedup_capacity: self.dedup_capacity,
            unhealthy_after: self.unhealthy_after,
        }
    }

    pub fn sweeper_config(&self) -> SweeperConfig {
        SweeperConfig {
            interval: self.sweep_interval,
            staleness_threshold: self.staleness_threshold,
            batch_limit: 500,
        }
    }
}
