//! `jobguard-core`: job execution domain model.
//!
//! This crate contains the **pure domain** of the job subsystem (no I/O): job
//! execution records and their lifecycle, static job definitions, per-type meta
//! snapshots and the typed results of refused lock acquisitions.

pub mod blocked;
pub mod clock;
pub mod definition;
pub mod error;
pub mod id;
pub mod job_info;
pub mod meta;

pub use blocked::{BlockReason, JobBlocked};
pub use clock::{Clock, FixedClock, SystemClock};
pub use definition::{JobDefinition, JobDefinitionBuilder, Trigger};
pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use job_info::{JobInfo, JobMessage, JobStatus, Level};
pub use meta::{DisabledJob, JobMeta, RunningJob};
