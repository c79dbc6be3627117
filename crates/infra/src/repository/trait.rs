use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use jobguard_core::{JobId, JobInfo, JobMessage, JobStatus};

use crate::error::RepositoryError;

/// Persistence boundary for job execution records.
///
/// Every list is ordered by `started` descending, ties broken by `job_id`
/// descending, so repeated scans see the same order.
///
/// Writes against a stopped record fail with [`RepositoryError::AlreadyStopped`]
/// and leave the record untouched. The per-field mutators exist so that the
/// heartbeat and the executing thread never overwrite each other's changes.
pub trait JobRepository: Send + Sync {
    fn find_one(&self, job_id: JobId) -> Result<Option<JobInfo>, RepositoryError>;

    fn find_all(&self) -> Result<Vec<JobInfo>, RepositoryError>;

    fn find_by_type(&self, job_type: &str) -> Result<Vec<JobInfo>, RepositoryError>;

    /// The newest `limit` jobs of any type.
    fn find_latest(&self, limit: usize) -> Result<Vec<JobInfo>, RepositoryError>;

    /// The newest `limit` jobs of one type.
    fn find_latest_by(&self, job_type: &str, limit: usize)
    -> Result<Vec<JobInfo>, RepositoryError>;

    /// The newest job of every type.
    fn find_latest_jobs_distinct(&self) -> Result<Vec<JobInfo>, RepositoryError>;

    /// Running jobs whose `last_updated` is strictly before `since`.
    fn find_running_without_update_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<JobInfo>, RepositoryError>;

    fn find_all_job_types(&self) -> Result<Vec<String>, RepositoryError>;

    /// Full upsert by id. Replacing a stopped record is rejected.
    fn create_or_update(&self, job: JobInfo) -> Result<JobInfo, RepositoryError>;

    /// Delete the record if it is stopped. Returns whether it was deleted.
    fn remove_if_stopped(&self, job_id: JobId) -> Result<bool, RepositoryError>;

    /// Append one message and bump `last_updated`; an error-level message also
    /// flips the status to ERROR.
    fn append_message(&self, job_id: JobId, message: JobMessage) -> Result<(), RepositoryError>;

    /// DEAD is rejected, ERROR to OK is a conflict (use `mark_restarted`) and
    /// SKIPPED leaves an ERROR status in place.
    fn set_job_status(&self, job_id: JobId, status: JobStatus) -> Result<(), RepositoryError>;

    /// Append the skip note and set SKIPPED unless the job is in ERROR.
    fn mark_skipped(&self, job_id: JobId, at: DateTime<Utc>) -> Result<(), RepositoryError>;

    /// Append the restart note and clear ERROR back to OK.
    fn mark_restarted(&self, job_id: JobId, at: DateTime<Utc>) -> Result<(), RepositoryError>;

    fn set_last_update(&self, job_id: JobId, at: DateTime<Utc>) -> Result<(), RepositoryError>;

    /// Set `stopped` (clamped to the record's own timestamps) and optionally a
    /// final status in one step.
    fn stop_job(
        &self,
        job_id: JobId,
        at: DateTime<Utc>,
        status: Option<JobStatus>,
    ) -> Result<JobInfo, RepositoryError>;

    /// Keep the newest `keep_last - 1` messages and append `note`.
    fn truncate_messages(
        &self,
        job_id: JobId,
        keep_last: usize,
        note: JobMessage,
    ) -> Result<(), RepositoryError>;

    fn count(&self) -> Result<usize, RepositoryError>;

    fn clear_all(&self) -> Result<(), RepositoryError>;
}

impl<S: JobRepository + ?Sized> JobRepository for Arc<S> {
    fn find_one(&self, job_id: JobId) -> Result<Option<JobInfo>, RepositoryError> {
        (**self).find_one(job_id)
    }

    fn find_all(&self) -> Result<Vec<JobInfo>, RepositoryError> {
        (**self).find_all()
    }

    fn find_by_type(&self, job_type: &str) -> Result<Vec<JobInfo>, RepositoryError> {
        (**self).find_by_type(job_type)
    }

    fn find_latest(&self, limit: usize) -> Result<Vec<JobInfo>, RepositoryError> {
        (**self).find_latest(limit)
    }

    fn find_latest_by(
        &self,
        job_type: &str,
        limit: usize,
    ) -> Result<Vec<JobInfo>, RepositoryError> {
        (**self).find_latest_by(job_type, limit)
    }

    fn find_latest_jobs_distinct(&self) -> Result<Vec<JobInfo>, RepositoryError> {
        (**self).find_latest_jobs_distinct()
    }

    fn find_running_without_update_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<JobInfo>, RepositoryError> {
        (**self).find_running_without_update_since(since)
    }

    fn find_all_job_types(&self) -> Result<Vec<String>, RepositoryError> {
        (**self).find_all_job_types()
    }

    fn create_or_update(&self, job: JobInfo) -> Result<JobInfo, RepositoryError> {
        (**self).create_or_update(job)
    }

    fn remove_if_stopped(&self, job_id: JobId) -> Result<bool, RepositoryError> {
        (**self).remove_if_stopped(job_id)
    }

    fn append_message(&self, job_id: JobId, message: JobMessage) -> Result<(), RepositoryError> {
        (**self).append_message(job_id, message)
    }

    fn set_job_status(&self, job_id: JobId, status: JobStatus) -> Result<(), RepositoryError> {
        (**self).set_job_status(job_id, status)
    }

    fn mark_skipped(&self, job_id: JobId, at: DateTime<Utc>) -> Result<(), RepositoryError> {
        (**self).mark_skipped(job_id, at)
    }

    fn mark_restarted(&self, job_id: JobId, at: DateTime<Utc>) -> Result<(), RepositoryError> {
        (**self).mark_restarted(job_id, at)
    }

    fn set_last_update(&self, job_id: JobId, at: DateTime<Utc>) -> Result<(), RepositoryError> {
        (**self).set_last_update(job_id, at)
    }

    fn stop_job(
        &self,
        job_id: JobId,
        at: DateTime<Utc>,
        status: Option<JobStatus>,
    ) -> Result<JobInfo, RepositoryError> {
        (**self).stop_job(job_id, at, status)
    }

    fn truncate_messages(
        &self,
        job_id: JobId,
        keep_last: usize,
        note: JobMessage,
    ) -> Result<(), RepositoryError> {
        (**self).truncate_messages(job_id, keep_last, note)
    }

    fn count(&self) -> Result<usize, RepositoryError> {
        (**self).count()
    }

    fn clear_all(&self) -> Result<(), RepositoryError> {
        (**self).clear_all()
    }
}

/// Newest first: `started` descending, then `job_id` descending.
pub fn newest_first(a: &JobInfo, b: &JobInfo) -> Ordering {
    b.started
        .cmp(&a.started)
        .then_with(|| b.job_id.cmp(&a.job_id))
}
