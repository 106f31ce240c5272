//! `jobsweep-core`: job metadata domain model.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the job status state machine, versioned metadata snapshots and
//! the clock abstraction used for staleness decisions.

pub mod clock;
pub mod error;
pub mod id;
pub mod metadata;
pub mod status;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{EventId, JobId};
pub use metadata::{JobMetadata, ResultInfo, StatusUpdate, Version};
pub use status::JobStatus;
