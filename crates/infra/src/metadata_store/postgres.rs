//! Postgres-backed metadata store.
//!
//! One row per job in a table whose name comes from configuration. The
//! compare-and-swap is a single statement:
//!
//! ```sql
//! UPDATE <table> SET ... WHERE job_id = $1 AND version = $2 RETURNING ...
//! ```
//!
//! Postgres row locking makes that statement atomic against every other
//! writer of the same row; a writer holding a stale version updates zero rows.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | MetadataStoreError |
//! |------------|----------------------|--------------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` (on create) |
//! | Database (other) | Any other | `Storage` |
//! | PoolTimedOut / PoolClosed / Io / Tls | N/A | `Unavailable` |
//! | Other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

use jobsweep_core::{Clock, JobId, JobMetadata, JobStatus, ResultInfo, StatusUpdate, Version};

use super::{MetadataStore, MetadataStoreError, UpdateOutcome};
use crate::config::MetadataStoreConfig;

const COLUMNS: &str =
    "job_id, status, enqueue_attempt_at, version, result_info, created_at, updated_at";

/// Whether `name` can be spliced into SQL as an unquoted table identifier.
pub fn is_valid_table_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= 63
        && (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Clone)]
pub struct PostgresMetadataStore {
    pool: Arc<PgPool>,
    table: String,
    clock: Arc<dyn Clock>,
}

impl PostgresMetadataStore {
    pub fn new(
        pool: PgPool,
        table: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, MetadataStoreError> {
        let table = table.into();
        if !is_valid_table_name(&table) {
            return Err(MetadataStoreError::Storage(format!(
                "invalid table name '{table}'"
            )));
        }
        Ok(Self {
            pool: Arc::new(pool),
            table,
            clock,
        })
    }

    /// Open a connection pool for `config`.
    pub async fn connect(
        config: &MetadataStoreConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, MetadataStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.endpoint)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        debug!(table = %config.table_name, region = %config.region, "metadata store connected");
        Self::new(pool, config.table_name.clone(), clock)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the metadata table and its status index if missing.
    pub async fn ensure_schema(&self) -> Result<(), MetadataStoreError> {
        let create_table = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                job_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                enqueue_attempt_at TIMESTAMPTZ NULL,
                version BIGINT NOT NULL CHECK (version > 0),
                result_info JSONB NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            table = self.table
        );
        let create_index = format!(
            "CREATE INDEX IF NOT EXISTS {table}_status_idx ON {table} (status, enqueue_attempt_at)",
            table = self.table
        );

        sqlx::query(&create_table)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_table", e))?;
        sqlx::query(&create_index)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_index", e))?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for PostgresMetadataStore {
    #[instrument(skip_all, fields(job_id = %job_id), err)]
    async fn create(&self, job_id: &JobId) -> Result<JobMetadata, MetadataStoreError> {
        let record = JobMetadata::new(job_id.clone(), self.clock.now());
        let sql = format!(
            "INSERT INTO {table} ({COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7)",
            table = self.table
        );

        sqlx::query(&sql)
            .bind(record.job_id.as_str())
            .bind(record.status.as_str())
            .bind(record.enqueue_attempt_at)
            .bind(record.version.get() as i64)
            .bind(Option::<serde_json::Value>::None)
            .bind(record.created_at)
            .bind(record.updated_at)
            .execute(&*self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    MetadataStoreError::AlreadyExists(job_id.clone())
                } else {
                    map_sqlx_error("create", e)
                }
            })?;

        Ok(record)
    }

    #[instrument(skip_all, fields(job_id = %job_id), err)]
    async fn get(&self, job_id: &JobId) -> Result<Option<JobMetadata>, MetadataStoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM {table} WHERE job_id = $1",
            table = self.table
        );
        let row = sqlx::query(&sql)
            .bind(job_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(record_from_row).transpose()
    }

    #[instrument(skip_all, fields(job_id = %job_id, expected = %expected, next = %update.status), err)]
    async fn conditional_update(
        &self,
        job_id: &JobId,
        expected: Version,
        update: StatusUpdate,
    ) -> Result<UpdateOutcome, MetadataStoreError> {
        let Some(current) = self.get(job_id).await? else {
            return Ok(UpdateOutcome::NotFound);
        };
        if current.version != expected {
            return Ok(UpdateOutcome::VersionConflict {
                current: current.version,
            });
        }

        let next = current.apply(&update, self.clock.now())?;
        let result_info = next
            .result_info
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| MetadataStoreError::Storage(format!("result info serialization failed: {e}")))?;

        let sql = format!(
            r#"
            UPDATE {table}
            SET status = $3, enqueue_attempt_at = $4, version = $5, result_info = $6, updated_at = $7
            WHERE job_id = $1 AND version = $2
            RETURNING {COLUMNS}
            "#,
            table = self.table
        );
        let row = sqlx::query(&sql)
            .bind(job_id.as_str())
            .bind(expected.get() as i64)
            .bind(next.status.as_str())
            .bind(next.enqueue_attempt_at)
            .bind(next.version.get() as i64)
            .bind(result_info)
            .bind(next.updated_at)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("conditional_update", e))?;

        match row {
            Some(row) => Ok(UpdateOutcome::Updated(record_from_row(&row)?)),
            // Lost the race between our read and our write.
            None => match self.get(job_id).await? {
                Some(now) => Ok(UpdateOutcome::VersionConflict {
                    current: now.version,
                }),
                None => Ok(UpdateOutcome::NotFound),
            },
        }
    }

    #[instrument(skip_all, fields(job_id = %job_id), err)]
    async fn delete(&self, job_id: &JobId) -> Result<Option<JobMetadata>, MetadataStoreError> {
        let sql = format!(
            "DELETE FROM {table} WHERE job_id = $1 RETURNING {COLUMNS}",
            table = self.table
        );
        let row = sqlx::query(&sql)
            .bind(job_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;

        row.as_ref().map(record_from_row).transpose()
    }

    #[instrument(skip(self), fields(status = %status), err)]
    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<JobMetadata>, MetadataStoreError> {
        let sql = format!(
            r#"
            SELECT {COLUMNS} FROM {table}
            WHERE status = $1
            ORDER BY enqueue_attempt_at ASC NULLS LAST, created_at ASC
            LIMIT $2
            "#,
            table = self.table
        );
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_by_status", e))?;

        rows.iter().map(record_from_row).collect()
    }
}

fn record_from_row(row: &PgRow) -> Result<JobMetadata, MetadataStoreError> {
    let decode = |e: sqlx::Error| MetadataStoreError::Storage(format!("failed to decode row: {e}"));

    let job_id: String = row.try_get("job_id").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    let enqueue_attempt_at: Option<DateTime<Utc>> =
        row.try_get("enqueue_attempt_at").map_err(decode)?;
    let version: i64 = row.try_get("version").map_err(decode)?;
    let result_info: Option<serde_json::Value> = row.try_get("result_info").map_err(decode)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(decode)?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(decode)?;

    let result_info = result_info
        .map(serde_json::from_value::<ResultInfo>)
        .transpose()
        .map_err(|e| MetadataStoreError::Storage(format!("invalid result_info: {e}")))?;
    let version = u64::try_from(version)
        .map_err(|_| MetadataStoreError::Storage(format!("negative version {version}")))?;

    Ok(JobMetadata {
        job_id: JobId::new(job_id)?,
        status: status.parse()?,
        enqueue_attempt_at,
        version: Version::new(version),
        result_info,
        created_at,
        updated_at,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

/// Map SQLx errors to MetadataStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> MetadataStoreError {
    match err {
        sqlx::Error::Database(db_err) => MetadataStoreError::Storage(format!(
            "database error in {operation}: {}",
            db_err.message()
        )),
        sqlx::Error::PoolTimedOut => {
            MetadataStoreError::Unavailable(format!("connection pool timed out in {operation}"))
        }
        sqlx::Error::PoolClosed => {
            MetadataStoreError::Unavailable(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::Io(e) => MetadataStoreError::Unavailable(format!("io error in {operation}: {e}")),
        sqlx::Error::Tls(e) => {
            MetadataStoreError::Unavailable(format!("tls error in {operation}: {e}"))
        }
        other => MetadataStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}
