//! Per-job-type metadata shared between executions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;

/// Keys starting with this prefix are reserved for lock bookkeeping.
pub const RESERVED_KEY_PREFIX: &str = "_e_";

/// Key holding the id of the execution that currently owns the run lock.
pub const KEY_RUNNING: &str = "_e_running";

/// Key marking a job type as disabled; its value is the operator comment.
pub const KEY_DISABLED: &str = "_e_disabled";

/// Reject keys that would collide with the reserved bookkeeping keys.
pub fn check_meta_key(key: &str) -> DomainResult<()> {
    if key.is_empty() || key.starts_with(RESERVED_KEY_PREFIX) {
        return Err(DomainError::validation(format!(
            "meta keys must not be empty and must not start with '{RESERVED_KEY_PREFIX}': '{key}'"
        )));
    }
    Ok(())
}

/// Snapshot of the metadata document of one job type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMeta {
    pub job_type: String,
    /// Id of the execution holding the run lock, if any.
    pub running: Option<String>,
    /// Operator comment if the job type is disabled.
    pub disabled: Option<String>,
    /// User key/value pairs (reserved keys excluded).
    pub values: BTreeMap<String, String>,
}

impl JobMeta {
    pub fn empty(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            ..Default::default()
        }
    }

    /// Build a snapshot from a raw document, splitting off the reserved keys.
    pub fn from_document(job_type: impl Into<String>, document: &BTreeMap<String, String>) -> Self {
        let values = document
            .iter()
            .filter(|(k, _)| !k.starts_with(RESERVED_KEY_PREFIX))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self {
            job_type: job_type.into(),
            running: document.get(KEY_RUNNING).cloned(),
            disabled: document.get(KEY_DISABLED).cloned(),
            values,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.is_some()
    }

    pub fn disabled_comment(&self) -> &str {
        self.disabled.as_deref().unwrap_or("")
    }
}

/// An active run lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunningJob {
    pub job_id: String,
    pub job_type: String,
}

impl RunningJob {
    pub fn new(job_id: impl Into<String>, job_type: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            job_type: job_type.into(),
        }
    }

    /// The lock holder as a [`JobId`], if it parses.
    pub fn parsed_job_id(&self) -> DomainResult<JobId> {
        self.job_id.parse()
    }
}

/// A job type that is currently disabled, with the operator's comment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DisabledJob {
    pub job_type: String,
    pub comment: String,
}

impl DisabledJob {
    pub fn new(job_type: impl Into<String>, comment: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            comment: comment.into(),
        }
    }
}
