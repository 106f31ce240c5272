//! Job metadata store boundary.
//!
//! One versioned [`JobMetadata`] record per job id. All mutation goes through
//! [`MetadataStore::conditional_update`], a compare-and-swap on the record
//! version: the write is applied only if the stored version still equals the
//! version the caller read.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use jobsweep_core::{DomainError, JobId, JobMetadata, JobStatus, StatusUpdate, Version};
use jobsweep_events::{ChangeEvent, ChangeKind, ChangePublisher};

pub use in_memory::InMemoryMetadataStore;
pub use postgres::PostgresMetadataStore;

/// Result of a conditional update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The write was applied; carries the new snapshot.
    Updated(JobMetadata),
    /// The stored version differs from the expected one. Nothing was written.
    VersionConflict { current: Version },
    /// No record with this id.
    NotFound,
}

/// Metadata store operation error.
///
/// Version conflicts and missing records are outcomes, not errors; see
/// [`UpdateOutcome`].
#[derive(Debug, Error)]
pub enum MetadataStoreError {
    /// The store could not be reached (connection refused, pool exhausted, ...).
    #[error("metadata store unavailable: {0}")]
    Unavailable(String),

    /// The requested status change violates the job state machine.
    #[error(transparent)]
    Transition(#[from] DomainError),

    #[error("job {0} already exists")]
    AlreadyExists(JobId),

    #[error("storage error: {0}")]
    Storage(String),

    /// The write committed but its change event could not be published.
    #[error("change publication failed: {0}")]
    Publish(String),
}

impl MetadataStoreError {
    /// Whether a retry of the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MetadataStoreError::Unavailable(_) | MetadataStoreError::Publish(_)
        )
    }
}

/// Durable, versioned job metadata.
///
/// Implementations must:
/// - start every record at [`Version::INITIAL`] in CREATED
/// - apply `conditional_update` atomically with respect to every other writer
///   of the same job id: exactly one of two racing writers with the same
///   expected version wins, the other observes `VersionConflict`
/// - derive the new snapshot through [`JobMetadata::apply`] so no backward
///   transition is ever persisted
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert a fresh CREATED record.
    async fn create(&self, job_id: &JobId) -> Result<JobMetadata, MetadataStoreError>;

    async fn get(&self, job_id: &JobId) -> Result<Option<JobMetadata>, MetadataStoreError>;

    /// Compare-and-swap on the record version.
    async fn conditional_update(
        &self,
        job_id: &JobId,
        expected: Version,
        update: StatusUpdate,
    ) -> Result<UpdateOutcome, MetadataStoreError>;

    /// Remove a record, returning its last snapshot.
    async fn delete(&self, job_id: &JobId) -> Result<Option<JobMetadata>, MetadataStoreError>;

    /// Records currently in `status`, oldest enqueue attempt first.
    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<JobMetadata>, MetadataStoreError>;
}

#[async_trait]
impl<S> MetadataStore for Arc<S>
where
    S: MetadataStore + ?Sized,
{
    async fn create(&self, job_id: &JobId) -> Result<JobMetadata, MetadataStoreError> {
        (**self).create(job_id).await
    }

    async fn get(&self, job_id: &JobId) -> Result<Option<JobMetadata>, MetadataStoreError> {
        (**self).get(job_id).await
    }

    async fn conditional_update(
        &self,
        job_id: &JobId,
        expected: Version,
        update: StatusUpdate,
    ) -> Result<UpdateOutcome, MetadataStoreError> {
        (**self).conditional_update(job_id, expected, update).await
    }

    async fn delete(&self, job_id: &JobId) -> Result<Option<JobMetadata>, MetadataStoreError> {
        (**self).delete(job_id).await
    }

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<JobMetadata>, MetadataStoreError> {
        (**self).list_by_status(status, limit).await
    }
}

/// Change-capture adapter: publishes one [`ChangeEvent`] after every
/// successful write to the wrapped store.
///
/// Publish happens only after the write is durable. A publish failure is
/// reported as [`MetadataStoreError::Publish`] even though the write stays
/// committed; callers re-read before acting again.
pub struct PublishingMetadataStore<S, P> {
    store: S,
    publisher: P,
}

impl<S, P> PublishingMetadataStore<S, P> {
    pub fn new(store: S, publisher: P) -> Self {
        Self { store, publisher }
    }

    pub fn into_parts(self) -> (S, P) {
        (self.store, self.publisher)
    }
}

impl<S, P> PublishingMetadataStore<S, P>
where
    P: ChangePublisher,
{
    fn emit(&self, kind: ChangeKind, record: &JobMetadata) -> Result<(), MetadataStoreError> {
        let event = ChangeEvent::from_snapshot(kind, record, record.updated_at);
        self.publisher
            .publish(event)
            .map_err(|err| MetadataStoreError::Publish(err.to_string()))
    }
}

#[async_trait]
impl<S, P> MetadataStore for PublishingMetadataStore<S, P>
where
    S: MetadataStore,
    P: ChangePublisher,
{
    async fn create(&self, job_id: &JobId) -> Result<JobMetadata, MetadataStoreError> {
        let record = self.store.create(job_id).await?;
        self.emit(ChangeKind::Insert, &record)?;
        Ok(record)
    }

    async fn get(&self, job_id: &JobId) -> Result<Option<JobMetadata>, MetadataStoreError> {
        self.store.get(job_id).await
    }

    async fn conditional_update(
        &self,
        job_id: &JobId,
        expected: Version,
        update: StatusUpdate,
    ) -> Result<UpdateOutcome, MetadataStoreError> {
        let outcome = self.store.conditional_update(job_id, expected, update).await?;
        if let UpdateOutcome::Updated(record) = &outcome {
            self.emit(ChangeKind::Modify, record)?;
        }
        Ok(outcome)
    }

    async fn delete(&self, job_id: &JobId) -> Result<Option<JobMetadata>, MetadataStoreError> {
        let removed = self.store.delete(job_id).await?;
        if let Some(record) = &removed {
            self.emit(ChangeKind::Remove, record)?;
        }
        Ok(removed)
    }

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<JobMetadata>, MetadataStoreError> {
        self.store.list_by_status(status, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobsweep_events::InMemoryChangeFeed;

    fn id(raw: &str) -> JobId {
        JobId::new(raw).unwrap()
    }

    #[tokio::test]
    async fn every_successful_write_publishes_exactly_one_event() {
        let feed = Arc::new(InMemoryChangeFeed::new());
        let store = PublishingMetadataStore::new(InMemoryMetadataStore::new(), feed.clone());

        let created = store.create(&id("J1")).await.unwrap();
        assert_eq!(feed.published_count(), 1);

        let outcome = store
            .conditional_update(
                &id("J1"),
                created.version,
                StatusUpdate::to(JobStatus::EnqueuePending),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, UpdateOutcome::Updated(_)));
        assert_eq!(feed.published_count(), 2);

        // Stale version: nothing written, nothing published.
        let outcome = store
            .conditional_update(
                &id("J1"),
                created.version,
                StatusUpdate::to(JobStatus::EnqueuePending),
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            UpdateOutcome::VersionConflict {
                current: Version::new(2)
            }
        );
        assert_eq!(feed.published_count(), 2);

        store.delete(&id("J1")).await.unwrap();
        assert_eq!(feed.published_count(), 3);
        assert!(store.delete(&id("J1")).await.unwrap().is_none());
        assert_eq!(feed.published_count(), 3);
    }

    #[test]
    fn only_unavailable_and_publish_errors_are_transient() {
        assert!(MetadataStoreError::Unavailable("x".into()).is_transient());
        assert!(MetadataStoreError::Publish("x".into()).is_transient());
        assert!(!MetadataStoreError::Storage("x".into()).is_transient());
        assert!(!MetadataStoreError::AlreadyExists(id("J1")).is_transient());
    }
}
