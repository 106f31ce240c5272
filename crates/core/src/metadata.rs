//! Versioned job metadata records.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;
use crate::status::JobStatus;

/// Optimistic concurrency token of a metadata record.
///
/// Starts at 1 when the record is created and increases by one on every
/// successful update. Writers supply the version they read; stores reject the
/// write if it no longer matches.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    pub const INITIAL: Version = Version(1);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl core::fmt::Display for Version {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Structured detail recorded with a terminal status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultInfo {
    /// Machine-readable reason (e.g. `"enqueue-timeout"`).
    pub reason: String,
    /// Human-readable explanation.
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

impl ResultInfo {
    /// Reason recorded when a job never left ENQUEUE_PENDING.
    pub const ENQUEUE_TIMEOUT: &'static str = "enqueue-timeout";

    pub fn new(
        reason: impl Into<String>,
        message: impl Into<String>,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            reason: reason.into(),
            message: message.into(),
            recorded_at,
        }
    }

    pub fn enqueue_timeout(
        pending_since: DateTime<Utc>,
        threshold: Duration,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self::new(
            Self::ENQUEUE_TIMEOUT,
            format!(
                "job was not picked up within {}s of its enqueue attempt at {}",
                threshold.as_secs(),
                pending_since.to_rfc3339()
            ),
            recorded_at,
        )
    }
}

/// Requested change to a record: the next status, plus result info when the
/// next status is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: JobStatus,
    pub result_info: Option<ResultInfo>,
}

impl StatusUpdate {
    pub fn to(status: JobStatus) -> Self {
        Self {
            status,
            result_info: None,
        }
    }

    pub fn with_result_info(mut self, info: ResultInfo) -> Self {
        self.result_info = Some(info);
        self
    }
}

/// Snapshot of one job's metadata record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMetadata {
    pub job_id: JobId,
    pub status: JobStatus,
    /// Set when the record enters ENQUEUE_PENDING.
    pub enqueue_attempt_at: Option<DateTime<Utc>>,
    pub version: Version,
    /// Written once, together with the terminal status.
    pub result_info: Option<ResultInfo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobMetadata {
    /// A freshly created record (CREATED, version 1).
    pub fn new(job_id: JobId, now: DateTime<Utc>) -> Self {
        Self {
            job_id,
            status: JobStatus::Created,
            enqueue_attempt_at: None,
            version: Version::INITIAL,
            result_info: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Derive the next snapshot for `update`.
    ///
    /// Rejects anything that is not a forward edge of the state machine and
    /// result info on non-terminal statuses. Terminal statuses have no outgoing
    /// edges, which keeps `result_info` immutable once set.
    pub fn apply(&self, update: &StatusUpdate, now: DateTime<Utc>) -> DomainResult<JobMetadata> {
        if !self.status.can_transition_to(update.status) {
            return Err(DomainError::illegal_transition(self.status, update.status));
        }
        if update.result_info.is_some() && !update.status.is_terminal() {
            return Err(DomainError::ResultInfoOnNonTerminal(update.status));
        }

        let mut next = self.clone();
        next.status = update.status;
        next.version = self.version.next();
        next.updated_at = now;

        if update.status == JobStatus::EnqueuePending {
            next.enqueue_attempt_at = Some(now);
        }
        if let Some(info) = &update.result_info {
            next.result_info = Some(info.clone());
        }

        Ok(next)
    }

    /// How long the record has been waiting in ENQUEUE_PENDING, if it is.
    pub fn pending_for(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        match (self.status, self.enqueue_attempt_at) {
            (JobStatus::EnqueuePending, Some(at)) => Some(now - at),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn job(id: &str) -> JobMetadata {
        JobMetadata::new(JobId::new(id).unwrap(), Utc::now())
    }

    #[test]
    fn entering_enqueue_pending_stamps_attempt_time() {
        let created = job("J1");
        let now = Utc::now();
        let pending = created
            .apply(&StatusUpdate::to(JobStatus::EnqueuePending), now)
            .unwrap();

        assert_eq!(pending.status, JobStatus::EnqueuePending);
        assert_eq!(pending.enqueue_attempt_at, Some(now));
        assert_eq!(pending.version, Version::new(2));
        assert_eq!(pending.pending_for(now), Some(chrono::Duration::zero()));
    }

    #[test]
    fn backward_transition_is_rejected() {
        let now = Utc::now();
        let failed = job("J1")
            .apply(&StatusUpdate::to(JobStatus::FinishedFailed), now)
            .unwrap();

        let err = failed
            .apply(&StatusUpdate::to(JobStatus::EnqueuePending), now)
            .unwrap_err();
        assert_eq!(
            err,
            DomainError::illegal_transition(JobStatus::FinishedFailed, JobStatus::EnqueuePending)
        );
    }

    #[test]
    fn result_info_requires_terminal_status() {
        let now = Utc::now();
        let info = ResultInfo::new("x", "y", now);
        let err = job("J1")
            .apply(
                &StatusUpdate::to(JobStatus::EnqueuePending).with_result_info(info.clone()),
                now,
            )
            .unwrap_err();
        assert_eq!(err, DomainError::ResultInfoOnNonTerminal(JobStatus::EnqueuePending));

        let pending = job("J1")
            .apply(&StatusUpdate::to(JobStatus::EnqueuePending), now)
            .unwrap();
        let failed = pending
            .apply(
                &StatusUpdate::to(JobStatus::FinishedFailed).with_result_info(info.clone()),
                now,
            )
            .unwrap();
        assert_eq!(failed.result_info, Some(info));
    }

    #[test]
    fn enqueue_timeout_result_carries_reason() {
        let now = Utc::now();
        let info = ResultInfo::enqueue_timeout(now, Duration::from_secs(300), now);
        assert_eq!(info.reason, "enqueue-timeout");
        assert!(info.message.contains("300s"));
    }

    fn any_status() -> impl Strategy<Value = JobStatus> {
        prop::sample::select(JobStatus::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn status_never_regresses(requests in prop::collection::vec(any_status(), 0..24)) {
            let now = Utc::now();
            let mut record = job("P1");
            let mut result_info: Option<ResultInfo> = None;

            for status in requests {
                let mut update = StatusUpdate::to(status);
                if status.is_terminal() {
                    update = update.with_result_info(ResultInfo::new("r", "m", now));
                }
                if let Ok(next) = record.apply(&update, now) {
                    prop_assert!(next.status.rank() > record.status.rank());
                    prop_assert_eq!(next.version, record.version.next());
                    if let Some(existing) = &result_info {
                        prop_assert_eq!(next.result_info.as_ref(), Some(existing));
                    }
                    result_info = next.result_info.clone();
                    record = next;
                }
            }
        }
    }
}
