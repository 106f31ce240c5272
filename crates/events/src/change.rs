use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobsweep_core::{EventId, JobId, JobMetadata, JobStatus, Version};

/// What kind of mutation a change event describes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Record created.
    Insert,
    /// Record updated.
    Modify,
    /// Record deleted or expired. The snapshot is the last known state.
    Remove,
    /// Unchanged record re-observed by the stale-job sweeper.
    Rescan,
}

/// One observed mutation of a job metadata record.
///
/// Notes:
/// - Immutable: produced once by the change source, never modified.
/// - May be delivered more than once; redeliveries keep the same `event_id`.
/// - Carries enough of the snapshot for handler predicates; handlers re-read the
///   store before writing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    event_id: EventId,
    kind: ChangeKind,

    job_id: JobId,
    status: JobStatus,
    enqueue_attempt_at: Option<DateTime<Utc>>,

    /// Record version after the mutation.
    version: Version,

    observed_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(
        event_id: EventId,
        kind: ChangeKind,
        job_id: JobId,
        status: JobStatus,
        enqueue_attempt_at: Option<DateTime<Utc>>,
        version: Version,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id,
            kind,
            job_id,
            status,
            enqueue_attempt_at,
            version,
            observed_at,
        }
    }

    /// Build a change event (fresh event id) from a record snapshot.
    pub fn from_snapshot(kind: ChangeKind, record: &JobMetadata, observed_at: DateTime<Utc>) -> Self {
        Self::new(
            EventId::new(),
            kind,
            record.job_id.clone(),
            record.status,
            record.enqueue_attempt_at,
            record.version,
            observed_at,
        )
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn kind(&self) -> ChangeKind {
        self.kind
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn enqueue_attempt_at(&self) -> Option<DateTime<Utc>> {
        self.enqueue_attempt_at
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobsweep_core::StatusUpdate;

    #[test]
    fn snapshot_fields_are_copied() {
        let now = Utc::now();
        let record = JobMetadata::new(JobId::new("J1").unwrap(), now)
            .apply(&StatusUpdate::to(JobStatus::EnqueuePending), now)
            .unwrap();

        let event = ChangeEvent::from_snapshot(ChangeKind::Modify, &record, now);

        assert_eq!(event.job_id().as_str(), "J1");
        assert_eq!(event.status(), JobStatus::EnqueuePending);
        assert_eq!(event.enqueue_attempt_at(), Some(now));
        assert_eq!(event.version(), Version::new(2));
        assert_eq!(event.kind(), ChangeKind::Modify);
    }

    #[test]
    fn wire_format_uses_stable_names() {
        let now = Utc::now();
        let record = JobMetadata::new(JobId::new("J9").unwrap(), now);
        let event = ChangeEvent::from_snapshot(ChangeKind::Insert, &record, now);

        let json: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(json["kind"], "insert");
        assert_eq!(json["status"], "CREATED");
        assert_eq!(json["job_id"], "J9");
        assert_eq!(json["version"], 1);

        let decoded = ChangeEvent::from_json(&event.to_json().unwrap()).unwrap();
        assert_eq!(decoded, event);
    }
}
