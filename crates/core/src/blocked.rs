//! Typed "job could not be started" results.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a run lock could not be acquired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum BlockReason {
    /// The job type was disabled by an operator.
    Disabled { job_type: String, comment: String },
    /// Another execution of the same type holds the lock.
    AlreadyRunning { job_type: String, job_id: String },
    /// A job type of the same mutex group holds a lock.
    MutexGroup {
        job_type: String,
        blocked_by: String,
    },
}

impl BlockReason {
    pub fn job_type(&self) -> &str {
        match self {
            BlockReason::Disabled { job_type, .. }
            | BlockReason::AlreadyRunning { job_type, .. }
            | BlockReason::MutexGroup { job_type, .. } => job_type,
        }
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, BlockReason::Disabled { .. })
    }
}

impl core::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            BlockReason::Disabled { job_type, comment } if comment.is_empty() => {
                write!(f, "job '{job_type}' is currently disabled")
            }
            BlockReason::Disabled { job_type, comment } => {
                write!(f, "job '{job_type}' is currently disabled: {comment}")
            }
            BlockReason::AlreadyRunning { job_type, job_id } => {
                write!(f, "job '{job_type}' is already running ({job_id})")
            }
            BlockReason::MutexGroup {
                job_type,
                blocked_by,
            } => write!(
                f,
                "job '{job_type}' blocked by currently running job '{blocked_by}'"
            ),
        }
    }
}

/// Lock acquisition was refused; no job execution was created.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("job blocked: {reason}")]
pub struct JobBlocked {
    pub reason: BlockReason,
}

impl From<BlockReason> for JobBlocked {
    fn from(reason: BlockReason) -> Self {
        Self { reason }
    }
}
