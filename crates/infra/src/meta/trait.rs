use std::collections::BTreeSet;
use std::sync::Arc;

use jobguard_core::{BlockReason, JobMeta, RunningJob};

use crate::error::RepositoryError;

/// Per-job-type key/value store that also carries the run locks and the
/// disabled flags.
///
/// Each job type owns one document. The reserved keys `_e_running` and
/// `_e_disabled` are only written through the lock methods; `set_value` and
/// `create_value` reject them.
pub trait JobMetaRepository: Send + Sync {
    fn get_value(&self, job_type: &str, key: &str) -> Result<Option<String>, RepositoryError>;

    /// Set (`Some`) or delete (`None`) a value. Returns the previous value.
    fn set_value(
        &self,
        job_type: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<Option<String>, RepositoryError>;

    /// Store `value` only if `key` is absent. Returns whether it was stored.
    fn create_value(&self, job_type: &str, key: &str, value: &str)
    -> Result<bool, RepositoryError>;

    /// Job types that currently have a meta document.
    fn find_all_job_types(&self) -> Result<BTreeSet<String>, RepositoryError>;

    fn get_job_meta(&self, job_type: &str) -> Result<JobMeta, RepositoryError>;

    /// Single atomic test-and-set over the whole mutex group.
    ///
    /// Checks, in this order: `job_type` disabled, `job_type` already locked,
    /// any other type of `mutex_types` locked. Only when all are clear is
    /// `job_type -> job_id` recorded. The outer `Result` carries store
    /// failures, the inner one the typed refusal.
    fn try_acquire_run_lock(
        &self,
        job_id: &str,
        job_type: &str,
        mutex_types: &BTreeSet<String>,
    ) -> Result<Result<(), BlockReason>, RepositoryError>;

    /// Idempotent unconditional release.
    fn release_run_lock(&self, job_type: &str) -> Result<(), RepositoryError>;

    /// Release only if `job_id` still holds the lock. Returns whether it did.
    fn release_run_lock_held_by(&self, job_type: &str, job_id: &str)
    -> Result<bool, RepositoryError>;

    fn running_job(&self, job_type: &str) -> Result<Option<RunningJob>, RepositoryError>;

    fn disable(&self, job_type: &str, comment: &str) -> Result<(), RepositoryError>;

    fn enable(&self, job_type: &str) -> Result<(), RepositoryError>;

    fn delete_all(&self) -> Result<(), RepositoryError>;
}

impl<S: JobMetaRepository + ?Sized> JobMetaRepository for Arc<S> {
    fn get_value(&self, job_type: &str, key: &str) -> Result<Option<String>, RepositoryError> {
        (**self).get_value(job_type, key)
    }

    fn set_value(
        &self,
        job_type: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<Option<String>, RepositoryError> {
        (**self).set_value(job_type, key, value)
    }

    fn create_value(
        &self,
        job_type: &str,
        key: &str,
        value: &str,
    ) -> Result<bool, RepositoryError> {
        (**self).create_value(job_type, key, value)
    }

    fn find_all_job_types(&self) -> Result<BTreeSet<String>, RepositoryError> {
        (**self).find_all_job_types()
    }

    fn get_job_meta(&self, job_type: &str) -> Result<JobMeta, RepositoryError> {
        (**self).get_job_meta(job_type)
    }

    fn try_acquire_run_lock(
        &self,
        job_id: &str,
        job_type: &str,
        mutex_types: &BTreeSet<String>,
    ) -> Result<Result<(), BlockReason>, RepositoryError> {
        (**self).try_acquire_run_lock(job_id, job_type, mutex_types)
    }

    fn release_run_lock(&self, job_type: &str) -> Result<(), RepositoryError> {
        (**self).release_run_lock(job_type)
    }

    fn release_run_lock_held_by(
        &self,
        job_type: &str,
        job_id: &str,
    ) -> Result<bool, RepositoryError> {
        (**self).release_run_lock_held_by(job_type, job_id)
    }

    fn running_job(&self, job_type: &str) -> Result<Option<RunningJob>, RepositoryError> {
        (**self).running_job(job_type)
    }

    fn disable(&self, job_type: &str, comment: &str) -> Result<(), RepositoryError> {
        (**self).disable(job_type, comment)
    }

    fn enable(&self, job_type: &str) -> Result<(), RepositoryError> {
        (**self).enable(job_type)
    }

    fn delete_all(&self) -> Result<(), RepositoryError> {
        (**self).delete_all()
    }
}
