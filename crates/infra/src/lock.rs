//! Run-lock facade over the meta repository and the mutex groups.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, instrument};

use jobguard_core::{DisabledJob, JobBlocked, JobId, RunningJob};

use crate::error::RepositoryError;
use crate::meta::JobMetaRepository;
use crate::mutex::JobMutexGroups;

/// Failure to acquire a run lock.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobLockError {
    #[error(transparent)]
    Blocked(#[from] JobBlocked),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Clone)]
pub struct JobLockService {
    meta: Arc<dyn JobMetaRepository>,
    mutex_groups: JobMutexGroups,
}

impl JobLockService {
    pub fn new(meta: Arc<dyn JobMetaRepository>, mutex_groups: JobMutexGroups) -> Self {
        Self { meta, mutex_groups }
    }

    pub fn mutex_groups(&self) -> &JobMutexGroups {
        &self.mutex_groups
    }

    #[instrument(skip(self), fields(job_type = %job_type, job_id = %job_id))]
    pub fn acquire_run_lock(&self, job_id: JobId, job_type: &str) -> Result<(), JobLockError> {
        let group = self.mutex_groups.mutex_job_types_for(job_type);
        match self
            .meta
            .try_acquire_run_lock(&job_id.to_string(), job_type, &group)?
        {
            Ok(()) => {
                debug!("run lock acquired");
                Ok(())
            }
            Err(reason) => {
                info!(reason = %reason, "run lock refused");
                Err(JobBlocked::from(reason).into())
            }
        }
    }

    pub fn release_run_lock(&self, job_type: &str) -> Result<(), RepositoryError> {
        self.meta.release_run_lock(job_type)
    }

    /// Release only if `job_id` is still the holder.
    pub fn release_run_lock_held_by(
        &self,
        job_type: &str,
        job_id: JobId,
    ) -> Result<bool, RepositoryError> {
        self.meta
            .release_run_lock_held_by(job_type, &job_id.to_string())
    }

    /// Release `running` if its holder has not changed since the snapshot.
    pub fn release_lock_of(&self, running: &RunningJob) -> Result<bool, RepositoryError> {
        self.meta
            .release_run_lock_held_by(&running.job_type, &running.job_id)
    }

    /// Snapshot of all active locks.
    pub fn running_jobs(&self) -> Result<Vec<RunningJob>, RepositoryError> {
        let mut running = Vec::new();
        for job_type in self.meta.find_all_job_types()? {
            if let Some(job) = self.meta.running_job(&job_type)? {
                running.push(job);
            }
        }
        Ok(running)
    }

    pub fn disable_job_type(&self, disabled: &DisabledJob) -> Result<(), RepositoryError> {
        info!(job_type = %disabled.job_type, comment = %disabled.comment, "disabling job type");
        self.meta.disable(&disabled.job_type, &disabled.comment)
    }

    pub fn enable_job_type(&self, job_type: &str) -> Result<(), RepositoryError> {
        info!(job_type = %job_type, "enabling job type");
        self.meta.enable(job_type)
    }

    pub fn disabled_job_types(&self) -> Result<BTreeSet<DisabledJob>, RepositoryError> {
        let mut disabled = BTreeSet::new();
        for job_type in self.meta.find_all_job_types()? {
            let meta = self.meta.get_job_meta(&job_type)?;
            if let Some(comment) = meta.disabled {
                disabled.insert(DisabledJob::new(job_type, comment));
            }
        }
        Ok(disabled)
    }
}

impl std::fmt::Debug for JobLockService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobLockService")
            .field("mutex_groups", &self.mutex_groups)
            .finish_non_exhaustive()
    }
}
