//! Strongly-typed job identifiers.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Path prefix under which job executions are addressed.
pub const JOB_URI_PREFIX: &str = "/internal/jobs/";

/// Identifier of a single job execution.
///
/// Globally unique and immutable once assigned. Renders as a bare UUID via
/// `Display` and as a job URI via [`JobId::uri`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Create a new identifier.
    ///
    /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
    /// for determinism.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// The job URI, e.g. `/internal/jobs/0190b5c8-...`.
    pub fn uri(&self) -> String {
        format!("{JOB_URI_PREFIX}{}", self.0)
    }

    /// Creation time embedded in a UUIDv7; `None` for other versions.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        let (secs, nanos) = self.0.get_timestamp()?.to_unix();
        DateTime::from_timestamp(i64::try_from(secs).ok()?, nanos)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for JobId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for JobId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<JobId> for Uuid {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl FromStr for JobId {
    type Err = DomainError;

    /// Accepts either the bare UUID or the job URI form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(JOB_URI_PREFIX).unwrap_or(s);
        let uuid =
            Uuid::from_str(raw).map_err(|e| DomainError::invalid_id(format!("JobId: {e}")))?;
        Ok(Self(uuid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_uuid_and_uri() {
        let id = JobId::new();

        let from_bare: JobId = id.to_string().parse().unwrap();
        let from_uri: JobId = id.uri().parse().unwrap();

        assert_eq!(from_bare, id);
        assert_eq!(from_uri, id);
    }

    #[test]
    fn v7_ids_carry_their_creation_time() {
        let before = Utc::now() - chrono::Duration::seconds(1);
        let created = JobId::new().created_at().unwrap();
        assert!(created >= before);
        assert!(JobId::from_uuid(Uuid::nil()).created_at().is_none());
    }

    #[test]
    fn rejects_garbage() {
        let err = "/internal/jobs/not-a-uuid".parse::<JobId>().unwrap_err();
        assert!(matches!(err, DomainError::InvalidId(_)));
    }
}
