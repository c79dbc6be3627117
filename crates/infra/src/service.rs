//! Job service facade: registry of runnables, triggering, queries and operator actions.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use jobguard_core::job_info::DEAD_MESSAGE;
use jobguard_core::{
    Clock, DisabledJob, JobBlocked, JobDefinition, JobId, JobInfo, JobMessage, JobStatus,
    SystemClock,
};

use crate::cleanup::clear_dead_locks::{DEFAULT_MISSING_JOB_GRACE, clear_dead_locks};
use crate::cleanup::stop_dead::stop_dead_jobs;
use crate::config::JobsConfig;
use crate::definitions::JobDefinitionService;
use crate::error::RepositoryError;
use crate::lock::{JobLockError, JobLockService};
use crate::log_layer::JobMessageSink;
use crate::meta::JobMetaRepository;
use crate::meta_handle::JobMetaHandle;
use crate::mutex::JobMutexGroups;
use crate::pool::WorkerPool;
use crate::repository::JobRepository;
use crate::runnable::JobRunnable;
use crate::runner::JobRunner;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobServiceError {
    #[error("unknown job type '{0}'")]
    UnknownJobType(String),

    #[error(transparent)]
    Blocked(#[from] JobBlocked),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("executor error: {0}")]
    Executor(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl JobServiceError {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked(_))
    }
}

impl From<JobLockError> for JobServiceError {
    fn from(err: JobLockError) -> Self {
        match err {
            JobLockError::Blocked(blocked) => Self::Blocked(blocked),
            JobLockError::Repository(e) => Self::Repository(e),
        }
    }
}

pub struct JobServiceBuilder {
    repository: Arc<dyn JobRepository>,
    meta: Arc<dyn JobMetaRepository>,
    mutex_groups: JobMutexGroups,
    clock: Arc<dyn Clock>,
    hostname: String,
    thread_count: usize,
    heartbeat_interval: Duration,
    runnables: Vec<Arc<dyn JobRunnable>>,
}

impl JobServiceBuilder {
    pub fn with_mutex_groups(mut self, mutex_groups: JobMutexGroups) -> Self {
        self.mutex_groups = mutex_groups;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn with_thread_count(mut self, thread_count: usize) -> Self {
        self.thread_count = thread_count;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Thread count and heartbeat interval from `config`.
    pub fn with_config(self, config: &JobsConfig) -> Self {
        self.with_thread_count(config.thread_count)
            .with_heartbeat_interval(config.heartbeat_interval)
    }

    pub fn register<R: JobRunnable + 'static>(self, runnable: R) -> Self {
        self.register_arc(Arc::new(runnable))
    }

    pub fn register_arc(mut self, runnable: Arc<dyn JobRunnable>) -> Self {
        self.runnables.push(runnable);
        self
    }

    pub fn build(self) -> Result<JobService, JobServiceError> {
        if self.thread_count == 0 {
            return Err(JobServiceError::InvalidConfiguration(
                "thread_count must be greater than zero".to_string(),
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(JobServiceError::InvalidConfiguration(
                "heartbeat_interval must be greater than zero".to_string(),
            ));
        }

        let mut runnables: BTreeMap<String, Arc<dyn JobRunnable>> = BTreeMap::new();
        for runnable in self.runnables {
            let key = runnable.definition().job_type().to_lowercase();
            if runnables.contains_key(&key) {
                return Err(JobServiceError::InvalidConfiguration(format!(
                    "job type '{}' is registered twice",
                    runnable.definition().job_type()
                )));
            }
            runnables.insert(key, runnable);
        }
        let definitions = JobDefinitionService::new(
            runnables.values().map(|r| r.definition().clone()),
        );

        info!(
            job_types = runnables.len(),
            thread_count = self.thread_count,
            hostname = %self.hostname,
            "job service started"
        );

        Ok(JobService {
            inner: Arc::new(Inner {
                locks: JobLockService::new(self.meta.clone(), self.mutex_groups),
                repository: self.repository,
                meta: self.meta,
                runnables,
                definitions,
                clock: self.clock,
                hostname: self.hostname,
                heartbeat_interval: self.heartbeat_interval,
                pool: WorkerPool::new("job-worker", self.thread_count),
            }),
        })
    }
}

struct Inner {
    repository: Arc<dyn JobRepository>,
    meta: Arc<dyn JobMetaRepository>,
    locks: JobLockService,
    runnables: BTreeMap<String, Arc<dyn JobRunnable>>,
    definitions: JobDefinitionService,
    clock: Arc<dyn Clock>,
    hostname: String,
    heartbeat_interval: Duration,
    pool: WorkerPool,
}

/// Entry point for triggering and inspecting jobs.
///
/// Cheap to clone; all clones share the registry, the stores and the worker
/// pool.
#[derive(Clone)]
pub struct JobService {
    inner: Arc<Inner>,
}

impl JobService {
    pub fn builder(
        repository: Arc<dyn JobRepository>,
        meta: Arc<dyn JobMetaRepository>,
    ) -> JobServiceBuilder {
        let defaults = JobsConfig::default();
        JobServiceBuilder {
            repository,
            meta,
            mutex_groups: JobMutexGroups::default(),
            clock: Arc::new(SystemClock),
            hostname: default_hostname(),
            thread_count: defaults.thread_count,
            heartbeat_interval: defaults.heartbeat_interval,
            runnables: Vec::new(),
        }
    }

    /// Start a job on the worker pool and return its id without waiting.
    ///
    /// A blocked start creates no job record.
    #[instrument(skip(self), fields(job_type = %job_type))]
    pub fn start_async_job(&self, job_type: &str) -> Result<JobId, JobServiceError> {
        let runner = self.prepare(job_type)?;
        let job_id = runner.job_id();
        self.inner
            .pool
            .execute(move || runner.run())
            .map_err(|e| JobServiceError::Executor(e.to_string()))?;
        Ok(job_id)
    }

    /// Run a job on the calling thread and return the stopped record.
    ///
    /// Job failures still end up in the record's status, not in the result.
    #[instrument(skip(self), fields(job_type = %job_type))]
    pub fn run_job_sync(&self, job_type: &str) -> Result<JobInfo, JobServiceError> {
        let runner = self.prepare(job_type)?;
        let job_id = runner.job_id();
        runner.run();
        self.inner
            .repository
            .find_one(job_id)?
            .ok_or(JobServiceError::Repository(RepositoryError::NotFound(job_id)))
    }

    fn prepare(&self, job_type: &str) -> Result<JobRunner, JobServiceError> {
        let runnable = self
            .inner
            .runnables
            .get(&job_type.to_lowercase())
            .cloned()
            .ok_or_else(|| JobServiceError::UnknownJobType(job_type.to_string()))?;
        let job_type = runnable.definition().job_type().to_string();
        let job_id = JobId::new();

        self.inner.locks.acquire_run_lock(job_id, &job_type)?;

        let job = JobInfo::new(job_id, &job_type, self.now(), &self.inner.hostname);
        if let Err(e) = self.inner.repository.create_or_update(job) {
            warn!(job_id = %job_id, error = %e, "failed to create job record");
            if let Err(release) = self.inner.locks.release_run_lock_held_by(&job_type, job_id) {
                warn!(job_id = %job_id, error = %release, "failed to release run lock");
            }
            return Err(e.into());
        }
        debug!(job_id = %job_id, uri = %job_id.uri(), "job created");

        Ok(JobRunner::start(self.clone(), runnable, job_id))
    }

    pub fn find_job(&self, job_id: JobId) -> Result<Option<JobInfo>, RepositoryError> {
        self.inner.repository.find_one(job_id)
    }

    /// The newest `limit` jobs, optionally of one type.
    pub fn find_jobs(
        &self,
        job_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<JobInfo>, RepositoryError> {
        match job_type {
            Some(job_type) => self.inner.repository.find_latest_by(job_type, limit),
            None => self.inner.repository.find_latest(limit),
        }
    }

    /// The newest job of every type.
    pub fn find_jobs_distinct(&self) -> Result<Vec<JobInfo>, RepositoryError> {
        self.inner.repository.find_latest_jobs_distinct()
    }

    /// Delete stopped jobs, optionally of one type. Running jobs stay.
    pub fn delete_jobs(&self, job_type: Option<&str>) -> Result<usize, RepositoryError> {
        let jobs = match job_type {
            Some(job_type) => self.inner.repository.find_by_type(job_type)?,
            None => self.inner.repository.find_all()?,
        };
        let mut deleted = 0;
        for job in jobs.iter().filter(|j| j.is_stopped()) {
            if self.inner.repository.remove_if_stopped(job.job_id)? {
                deleted += 1;
            }
        }
        info!(deleted, job_type = ?job_type, "deleted stopped jobs");
        Ok(deleted)
    }

    /// Operator action: stop a running job as DEAD and free its run lock.
    ///
    /// The executing thread is not interrupted; its later writes are rejected.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub fn kill_job(&self, job_id: JobId) -> Result<JobInfo, RepositoryError> {
        let now = self.now();
        self.inner
            .repository
            .append_message(job_id, JobMessage::warning(DEAD_MESSAGE, now))?;
        let job = self
            .inner
            .repository
            .stop_job(job_id, now, Some(JobStatus::Dead))?;
        self.inner
            .locks
            .release_run_lock_held_by(&job.job_type, job_id)?;
        warn!(job_type = %job.job_type, "job killed");
        Ok(job)
    }

    /// Mark running jobs without a heartbeat for `threshold` as DEAD.
    ///
    /// Run locks are left to [`JobService::clear_run_locks`].
    pub fn kill_jobs_dead_since(&self, threshold: Duration) -> Result<Vec<JobId>, RepositoryError> {
        stop_dead_jobs(self.inner.repository.as_ref(), self.now(), threshold)
    }

    /// Release run locks whose job is stopped or no longer exists.
    pub fn clear_run_locks(&self) -> Result<Vec<String>, RepositoryError> {
        clear_dead_locks(
            self.inner.repository.as_ref(),
            &self.inner.locks,
            self.now(),
            DEFAULT_MISSING_JOB_GRACE,
        )
    }

    pub fn append_message(&self, job_id: JobId, message: JobMessage) -> Result<(), RepositoryError> {
        self.inner.repository.append_message(job_id, message)
    }

    /// Heartbeat.
    pub fn keep_alive(&self, job_id: JobId) -> Result<(), RepositoryError> {
        self.inner.repository.set_last_update(job_id, self.now())
    }

    /// Record that the job found nothing to do; an ERROR status is kept.
    pub fn mark_skipped(&self, job_id: JobId) -> Result<(), RepositoryError> {
        self.inner.repository.mark_skipped(job_id, self.now())
    }

    /// Record a restart; the status returns to OK.
    pub fn mark_restarted(&self, job_id: JobId) -> Result<(), RepositoryError> {
        self.inner.repository.mark_restarted(job_id, self.now())
    }

    pub fn disable_job_type(&self, job_type: &str, comment: &str) -> Result<(), RepositoryError> {
        self.inner
            .locks
            .disable_job_type(&DisabledJob::new(job_type, comment))
    }

    pub fn enable_job_type(&self, job_type: &str) -> Result<(), RepositoryError> {
        self.inner.locks.enable_job_type(job_type)
    }

    pub fn disabled_job_types(&self) -> Result<BTreeSet<DisabledJob>, RepositoryError> {
        self.inner.locks.disabled_job_types()
    }

    pub fn job_definitions(&self) -> Vec<&JobDefinition> {
        self.inner.definitions.job_definitions()
    }

    pub fn job_definition(&self, job_type: &str) -> Option<&JobDefinition> {
        self.inner.definitions.job_definition(job_type)
    }

    pub fn definitions(&self) -> &JobDefinitionService {
        &self.inner.definitions
    }

    pub fn job_meta(&self, job_type: &str) -> JobMetaHandle {
        JobMetaHandle::new(self.inner.meta.clone(), job_type)
    }

    /// Stop accepting jobs and wait for queued and running ones.
    pub fn shutdown(&self) {
        self.inner.pool.shutdown();
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub fn hostname(&self) -> &str {
        &self.inner.hostname
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.inner.heartbeat_interval
    }

    pub fn repository(&self) -> &Arc<dyn JobRepository> {
        &self.inner.repository
    }

    pub fn meta_repository(&self) -> &Arc<dyn JobMetaRepository> {
        &self.inner.meta
    }

    pub fn lock_service(&self) -> &JobLockService {
        &self.inner.locks
    }
}

impl JobMessageSink for JobService {
    fn append(&self, job_id: JobId, message: JobMessage) {
        match self.append_message(job_id, message) {
            Ok(()) => {}
            Err(RepositoryError::AlreadyStopped(_)) => {
                debug!(job_id = %job_id, "job already stopped; dropping captured log line")
            }
            // Logged under this crate's target, which the log layer ignores.
            Err(e) => warn!(job_id = %job_id, error = %e, "failed to append captured log line"),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        JobService::now(self)
    }
}

impl std::fmt::Debug for JobService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobService")
            .field("job_types", &self.inner.runnables.keys().collect::<Vec<_>>())
            .field("hostname", &self.inner.hostname)
            .field("heartbeat_interval", &self.inner.heartbeat_interval)
            .finish_non_exhaustive()
    }
}

fn default_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
