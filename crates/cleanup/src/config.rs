//! Environment-driven configuration.
//!
//! Everything goes through a lookup function so parsing can be tested without
//! touching the process environment.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use jobsweep_infra::config::{ChangeStreamConfig, CleanupConfig, ConfigError, MetadataStoreConfig};

/// Load and validate the cleanup configuration from the process environment.
///
/// | Env Var                          | Default                                |
/// |----------------------------------|----------------------------------------|
/// | `METADATA_STORE_URL`             | required                               |
/// | `JOB_METADATA_TABLE`             | required                               |
/// | `AWS_REGION`                     | `local`                                |
/// | `METADATA_STORE_MAX_CONNECTIONS` | `10`                                   |
/// | `RETRY_BUDGET`                   | `3`                                    |
/// | `ENQUEUE_STALENESS_SECS`         | `300`                                  |
/// | `STORE_CALL_TIMEOUT_MS`          | `5000`                                 |
/// | `CONFLICT_RETRIES`               | `3`                                    |
/// | `DISPATCH_WORKERS`               | `4`                                    |
/// | `DISPATCH_BATCH_SIZE`            | `16`                                   |
/// | `POLL_WAIT_MS`                   | `1000`                                 |
/// | `RETRY_BASE_BACKOFF_MS`          | `200`                                  |
/// | `RETRY_MAX_BACKOFF_MS`           | `10000`                                |
/// | `SHUTDOWN_GRACE_SECS`            | `30`                                   |
/// | `SWEEP_INTERVAL_SECS`            | `60`                                   |
/// | `DEDUP_CAPACITY`                 | `10000`                                |
/// | `UNHEALTHY_AFTER`                | `5`                                    |
/// | `CHANGE_STREAM_URL`              | unset (in-process feed)                |
/// | `CHANGE_STREAM_NAME`             | `jobsweep:job-metadata-changes`        |
/// | `CHANGE_STREAM_GROUP`            | `jobsweep-cleanup`                     |
/// | `CHANGE_STREAM_CONSUMER`         | `cleanup-1`                            |
/// | `CHANGE_STREAM_CLAIM_IDLE_SECS`  | `60`                                   |
/// | `CHANGE_STREAM_MAX_DELIVERIES`   | `16`                                   |
/// | `CHANGE_STREAM_DEAD_LETTER`      | `jobsweep:job-metadata-changes:dlq`    |
pub fn from_env() -> Result<CleanupConfig, ConfigError> {
    from_lookup(|key| std::env::var(key).ok())
}

/// Build the configuration from an arbitrary key lookup.
///
/// Empty values count as unset.
pub fn from_lookup<F>(lookup: F) -> Result<CleanupConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let env = Env(lookup);

    let endpoint = env.required("METADATA_STORE_URL")?;
    let table = env.required("JOB_METADATA_TABLE")?;
    let mut store = MetadataStoreConfig::new(endpoint, table);
    if let Some(region) = env.get("AWS_REGION") {
        store = store.with_region(region);
    }
    env.parse_into("METADATA_STORE_MAX_CONNECTIONS", &mut store.max_connections)?;

    let mut config = CleanupConfig::new(store);
    env.parse_into("RETRY_BUDGET", &mut config.retry_budget)?;
    env.secs_into("ENQUEUE_STALENESS_SECS", &mut config.staleness_threshold)?;
    env.millis_into("STORE_CALL_TIMEOUT_MS", &mut config.call_timeout)?;
    env.parse_into("CONFLICT_RETRIES", &mut config.conflict_retries)?;
    env.parse_into("DISPATCH_WORKERS", &mut config.workers)?;
    env.parse_into("DISPATCH_BATCH_SIZE", &mut config.batch_size)?;
    env.millis_into("POLL_WAIT_MS", &mut config.poll_wait)?;
    env.millis_into("RETRY_BASE_BACKOFF_MS", &mut config.base_backoff)?;
    env.millis_into("RETRY_MAX_BACKOFF_MS", &mut config.max_backoff)?;
    env.secs_into("SHUTDOWN_GRACE_SECS", &mut config.shutdown_grace)?;
    env.secs_into("SWEEP_INTERVAL_SECS", &mut config.sweep_interval)?;
    env.parse_into("DEDUP_CAPACITY", &mut config.dedup_capacity)?;
    env.parse_into("UNHEALTHY_AFTER", &mut config.unhealthy_after)?;

    if let Some(url) = env.get("CHANGE_STREAM_URL") {
        let mut stream = ChangeStreamConfig::new(url);
        if let Some(name) = env.get("CHANGE_STREAM_NAME") {
            stream.stream = name;
        }
        if let Some(group) = env.get("CHANGE_STREAM_GROUP") {
            stream.group = group;
        }
        if let Some(consumer) = env.get("CHANGE_STREAM_CONSUMER") {
            stream.consumer = consumer;
        }
        if let Some(dlq) = env.get("CHANGE_STREAM_DEAD_LETTER") {
            stream.dead_letter_stream = dlq;
        }
        env.secs_into("CHANGE_STREAM_CLAIM_IDLE_SECS", &mut stream.claim_idle)?;
        env.parse_into("CHANGE_STREAM_MAX_DELIVERIES", &mut stream.max_deliveries)?;
        config.change_stream = Some(stream);
    }

    config.validate()?;
    Ok(config)
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.get(key).ok_or(ConfigError::Missing(key))
    }

    fn parse_into<T>(&self, key: &'static str, slot: &mut T) -> Result<(), ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        if let Some(raw) = self.get(key) {
            *slot = raw
                .parse()
                .map_err(|e: T::Err| ConfigError::invalid(key, format!("'{raw}': {e}")))?;
        }
        Ok(())
    }

    fn secs_into(&self, key: &'static str, slot: &mut Duration) -> Result<(), ConfigError> {
        let mut secs = slot.as_secs();
        self.parse_into(key, &mut secs)?;
        *slot = Duration::from_secs(secs);
        Ok(())
    }

    fn millis_into(&self, key: &'static str, slot: &mut Duration) -> Result<(), ConfigError> {
        let mut millis = u64::try_from(slot.as_millis()).unwrap_or(u64::MAX);
        self.parse_into(key, &mut millis)?;
        *slot = Duration::from_millis(millis);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<CleanupConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        from_lookup(|key| vars.get(key).cloned())
    }

    const REQUIRED: [(&str, &str); 2] = [
        ("METADATA_STORE_URL", "postgres://localhost/jobs"),
        ("JOB_METADATA_TABLE", "job_metadata"),
    ];

    #[test]
    fn minimal_environment_uses_defaults() {
        let config = load(&REQUIRED).unwrap();
        assert_eq!(config.metadata_store.table_name, "job_metadata");
        assert_eq!(config.metadata_store.region, "local");
        assert_eq!(config.retry_budget, 3);
        assert_eq!(config.staleness_threshold, Duration::from_secs(300));
        assert_eq!(config.change_stream, None);
    }

    #[test]
    fn missing_table_is_reported_by_name() {
        let err = load(&[("METADATA_STORE_URL", "postgres://localhost/jobs")]).unwrap_err();
        assert_eq!(err, ConfigError::Missing("JOB_METADATA_TABLE"));

        let blank = load(&[
            ("METADATA_STORE_URL", "postgres://localhost/jobs"),
            ("JOB_METADATA_TABLE", "   "),
        ])
        .unwrap_err();
        assert_eq!(blank, ConfigError::Missing("JOB_METADATA_TABLE"));
    }

    #[test]
    fn overrides_are_parsed() {
        let mut vars = REQUIRED.to_vec();
        vars.extend([
            ("AWS_REGION", "eu-west-1"),
            ("RETRY_BUDGET", "5"),
            ("ENQUEUE_STALENESS_SECS", "900"),
            ("STORE_CALL_TIMEOUT_MS", "250"),
            ("CHANGE_STREAM_URL", "redis://cache:6379"),
            ("CHANGE_STREAM_CONSUMER", "cleanup-7"),
        ]);
        let config = load(&vars).unwrap();

        assert_eq!(config.metadata_store.region, "eu-west-1");
        assert_eq!(config.retry_budget, 5);
        assert_eq!(config.staleness_threshold, Duration::from_secs(900));
        assert_eq!(config.call_timeout, Duration::from_millis(250));
        let stream = config.change_stream.unwrap();
        assert_eq!(stream.url, "redis://cache:6379");
        assert_eq!(stream.consumer, "cleanup-7");
        assert_eq!(stream.group, "jobsweep-cleanup");
    }

    #[test]
    fn malformed_numbers_and_invalid_values_are_rejected() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("RETRY_BUDGET", "three"));
        assert!(matches!(
            load(&vars),
            Err(ConfigError::Invalid { key: "RETRY_BUDGET", .. })
        ));

        let mut vars = REQUIRED.to_vec();
        vars.push(("RETRY_BUDGET", "0"));
        assert!(matches!(
            load(&vars),
            Err(ConfigError::Invalid { key: "retry_budget", .. })
        ));
    }
}
