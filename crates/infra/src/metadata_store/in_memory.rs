use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use jobsweep_core::{Clock, JobId, JobMetadata, JobStatus, StatusUpdate, SystemClock, Version};

use super::{MetadataStore, MetadataStoreError, UpdateOutcome};

/// In-memory metadata store.
///
/// Intended for tests/dev. The compare-and-swap runs under the write lock, so
/// concurrent writers of the same record are serialized.
#[derive(Debug)]
pub struct InMemoryMetadataStore {
    records: RwLock<HashMap<JobId, JobMetadata>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> MetadataStoreError {
    MetadataStoreError::Storage("lock poisoned".to_string())
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn create(&self, job_id: &JobId) -> Result<JobMetadata, MetadataStoreError> {
        let mut records = self.records.write().map_err(|_| poisoned())?;
        if records.contains_key(job_id) {
            return Err(MetadataStoreError::AlreadyExists(job_id.clone()));
        }

        let record = JobMetadata::new(job_id.clone(), self.clock.now());
        records.insert(job_id.clone(), record.clone());
        Ok(record)
    }

    async fn get(&self, job_id: &JobId) -> Result<Option<JobMetadata>, MetadataStoreError> {
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(records.get(job_id).cloned())
    }

    async fn conditional_update(
        &self,
        job_id: &JobId,
        expected: Version,
        update: StatusUpdate,
    ) -> Result<UpdateOutcome, MetadataStoreError> {
        let mut records = self.records.write().map_err(|_| poisoned())?;
        let Some(current) = records.get_mut(job_id) else {
            return Ok(UpdateOutcome::NotFound);
        };

        if current.version != expected {
            return Ok(UpdateOutcome::VersionConflict {
                current: current.version,
            });
        }

        let next = current.apply(&update, self.clock.now())?;
        *current = next.clone();
        Ok(UpdateOutcome::Updated(next))
    }

    async fn delete(&self, job_id: &JobId) -> Result<Option<JobMetadata>, MetadataStoreError> {
        let mut records = self.records.write().map_err(|_| poisoned())?;
        Ok(records.remove(job_id))
    }

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<JobMetadata>, MetadataStoreError> {
        let records = self.records.read().map_err(|_| poisoned())?;
        let mut matching: Vec<JobMetadata> = records
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|r| (r.enqueue_attempt_at, r.created_at));
        matching.truncate(limit);
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobsweep_core::{DomainError, ManualClock, ResultInfo};
    use std::time::Duration;

    fn id(raw: &str) -> JobId {
        JobId::new(raw).unwrap()
    }

    #[tokio::test]
    async fn create_twice_is_rejected() {
        let store = InMemoryMetadataStore::new();
        let record = store.create(&id("J1")).await.unwrap();
        assert_eq!(record.status, JobStatus::Created);
        assert_eq!(record.version, Version::INITIAL);

        assert!(matches!(
            store.create(&id("J1")).await,
            Err(MetadataStoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn conditional_update_reports_conflict_and_missing_records() {
        let store = InMemoryMetadataStore::new();
        store.create(&id("J1")).await.unwrap();

        let outcome = store
            .conditional_update(&id("J1"), Version::new(7), StatusUpdate::to(JobStatus::EnqueuePending))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            UpdateOutcome::VersionConflict {
                current: Version::INITIAL
            }
        );

        let outcome = store
            .conditional_update(&id("nope"), Version::INITIAL, StatusUpdate::to(JobStatus::EnqueuePending))
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::NotFound);
    }

    #[tokio::test]
    async fn backward_transition_is_never_persisted() {
        let store = InMemoryMetadataStore::new();
        let created = store.create(&id("J1")).await.unwrap();
        let info = ResultInfo::new("r", "m", created.created_at);

        let UpdateOutcome::Updated(failed) = store
            .conditional_update(
                &id("J1"),
                created.version,
                StatusUpdate::to(JobStatus::FinishedFailed).with_result_info(info),
            )
            .await
            .unwrap()
        else {
            panic!("expected update");
        };

        let err = store
            .conditional_update(&id("J1"), failed.version, StatusUpdate::to(JobStatus::EnqueuePending))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MetadataStoreError::Transition(DomainError::IllegalTransition { .. })
        ));
        assert_eq!(store.get(&id("J1")).await.unwrap(), Some(failed));
    }

    #[tokio::test]
    async fn list_by_status_orders_by_enqueue_attempt() {
        let clock = Arc::new(ManualClock::default());
        let store = InMemoryMetadataStore::with_clock(clock.clone());

        for raw in ["J2", "J1", "J3"] {
            let created = store.create(&id(raw)).await.unwrap();
            if raw != "J3" {
                store
                    .conditional_update(&id(raw), created.version, StatusUpdate::to(JobStatus::EnqueuePending))
                    .await
                    .unwrap();
            }
            clock.advance(Duration::from_secs(1));
        }

        let pending = store.list_by_status(JobStatus::EnqueuePending, 10).await.unwrap();
        let ids: Vec<_> = pending.iter().map(|r| r.job_id.as_str()).collect();
        assert_eq!(ids, vec!["J2", "J1"]);

        let limited = store.list_by_status(JobStatus::EnqueuePending, 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }
}
