//! Job status state machine.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Lifecycle status of a job metadata record.
///
/// Status only ever moves forward:
///
/// ```text
/// CREATED -> ENQUEUE_PENDING -> IN_PROGRESS -> FINISHED_SUCCESS
///    |              |                |
///    +--------------+----------------+-----> FINISHED_FAILED
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Created,
    EnqueuePending,
    InProgress,
    FinishedSuccess,
    FinishedFailed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Created,
        JobStatus::EnqueuePending,
        JobStatus::InProgress,
        JobStatus::FinishedSuccess,
        JobStatus::FinishedFailed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::FinishedSuccess | JobStatus::FinishedFailed)
    }

    /// Whether `self -> next` is an edge of the state machine.
    ///
    /// Self-transitions are not edges.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Created, EnqueuePending)
                | (Created, FinishedFailed)
                | (EnqueuePending, InProgress)
                | (EnqueuePending, FinishedFailed)
                | (InProgress, FinishedSuccess)
                | (InProgress, FinishedFailed)
        )
    }

    /// Position along the lifecycle; used to assert that status never regresses.
    pub fn rank(self) -> u8 {
        match self {
            JobStatus::Created => 0,
            JobStatus::EnqueuePending => 1,
            JobStatus::InProgress => 2,
            JobStatus::FinishedSuccess | JobStatus::FinishedFailed => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Created => "CREATED",
            JobStatus::EnqueuePending => "ENQUEUE_PENDING",
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::FinishedSuccess => "FINISHED_SUCCESS",
            JobStatus::FinishedFailed => "FINISHED_FAILED",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job status '{s}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for from in [JobStatus::FinishedSuccess, JobStatus::FinishedFailed] {
            for to in JobStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be rejected");
            }
        }
    }

    #[test]
    fn cleanup_path_reaches_failed_from_pre_queue_states() {
        assert!(JobStatus::Created.can_transition_to(JobStatus::FinishedFailed));
        assert!(JobStatus::EnqueuePending.can_transition_to(JobStatus::FinishedFailed));
        assert!(!JobStatus::EnqueuePending.can_transition_to(JobStatus::FinishedSuccess));
        assert!(!JobStatus::Created.can_transition_to(JobStatus::InProgress));
    }

    #[test]
    fn every_edge_moves_forward() {
        for from in JobStatus::ALL {
            for to in JobStatus::ALL {
                if from.can_transition_to(to) {
                    assert!(to.rank() > from.rank(), "{from} -> {to} regresses");
                }
            }
        }
    }

    #[test]
    fn wire_names_round_trip() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
        assert!("RUNNING".parse::<JobStatus>().is_err());
    }
}
