use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use jobguard_core::{Clock, RunningJob};

use super::{CleanupReport, CleanupStrategy};
use crate::error::RepositoryError;
use crate::lock::JobLockService;
use crate::repository::JobRepository;

/// A lock whose job record is missing is only released once the lock holder
/// is older than this; the record is written right after the lock is taken.
pub const DEFAULT_MISSING_JOB_GRACE: Duration = Duration::from_secs(60);

/// Releases run locks whose job is stopped or does not exist.
pub struct ClearDeadLocks {
    repository: Arc<dyn JobRepository>,
    locks: JobLockService,
    clock: Arc<dyn Clock>,
    missing_job_grace: Duration,
    interval: Duration,
}

impl ClearDeadLocks {
    pub const NAME: &'static str = "clear_dead_locks";

    pub fn new(
        repository: Arc<dyn JobRepository>,
        locks: JobLockService,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repository,
            locks,
            clock,
            missing_job_grace: DEFAULT_MISSING_JOB_GRACE,
            interval: Duration::from_secs(5 * 60),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_missing_job_grace(mut self, grace: Duration) -> Self {
        self.missing_job_grace = grace;
        self
    }
}

impl CleanupStrategy for ClearDeadLocks {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn do_cleanup(&self) -> Result<CleanupReport, RepositoryError> {
        let released = clear_dead_locks(
            self.repository.as_ref(),
            &self.locks,
            self.clock.now(),
            self.missing_job_grace,
        )?;
        Ok(CleanupReport::new(Self::NAME, released.len()))
    }
}

/// Release every lock whose job is stopped, or missing for longer than
/// `missing_job_grace`. Returns the job types that were unlocked.
///
/// Release is compare-and-delete, so a lock re-acquired by a new execution
/// in the meantime is kept.
pub fn clear_dead_locks(
    repository: &dyn JobRepository,
    locks: &JobLockService,
    now: DateTime<Utc>,
    missing_job_grace: Duration,
) -> Result<Vec<String>, RepositoryError> {
    let mut released = Vec::new();
    for running in locks.running_jobs()? {
        if !is_dead(repository, &running, now, missing_job_grace)? {
            continue;
        }
        if locks.release_lock_of(&running)? {
            info!(job_type = %running.job_type, job_id = %running.job_id, "Clear lock of dead job");
            released.push(running.job_type);
        }
    }
    Ok(released)
}

fn is_dead(
    repository: &dyn JobRepository,
    running: &RunningJob,
    now: DateTime<Utc>,
    missing_job_grace: Duration,
) -> Result<bool, RepositoryError> {
    let Ok(job_id) = running.parsed_job_id() else {
        debug!(job_type = %running.job_type, job_id = %running.job_id, "lock held by unparsable id");
        return Ok(true);
    };
    match repository.find_one(job_id)? {
        Some(job) => Ok(job.is_stopped()),
        None => {
            let grace =
                chrono::Duration::from_std(missing_job_grace).unwrap_or(chrono::Duration::zero());
            Ok(job_id
                .created_at()
                .is_none_or(|created| created + grace < now))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{InMemoryJobMetaRepository, JobMetaRepository};
    use crate::mutex::JobMutexGroups;
    use crate::repository::InMemoryJobRepository;
    use chrono::Duration as ChronoDuration;
    use jobguard_core::{FixedClock, JobId, JobInfo};

    struct Fixture {
        repo: Arc<InMemoryJobRepository>,
        locks: JobLockService,
        clock: Arc<FixedClock>,
    }

    fn fixture() -> Fixture {
        Fixture {
            repo: InMemoryJobRepository::arc(),
            locks: JobLockService::new(InMemoryJobMetaRepository::arc(), JobMutexGroups::default()),
            clock: Arc::new(FixedClock::new(Utc::now())),
        }
    }

    impl Fixture {
        fn strategy(&self) -> ClearDeadLocks {
            ClearDeadLocks::new(self.repo.clone(), self.locks.clone(), self.clock.clone())
        }

        fn running(&self, job_type: &str) -> JobId {
            let job_id = JobId::new();
            self.locks.acquire_run_lock(job_id, job_type).unwrap();
            self.repo
                .create_or_update(JobInfo::new(job_id, job_type, self.clock.now(), "h"))
                .unwrap();
            job_id
        }
    }

    #[test]
    fn releases_lock_of_stopped_job_only() {
        let f = fixture();
        let dead = f.running("Import");
        let alive = f.running("Export");
        f.repo
            .stop_job(dead, f.clock.now(), Some(jobguard_core::JobStatus::Dead))
            .unwrap();

        let report = f.strategy().do_cleanup().unwrap();

        assert_eq!(report.affected, 1);
        let running = f.locks.running_jobs().unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].job_id, alive.to_string());
    }

    #[test]
    fn missing_job_is_released_after_grace() {
        let f = fixture();
        let job_id = JobId::new();
        f.locks.acquire_run_lock(job_id, "Import").unwrap();

        assert_eq!(f.strategy().do_cleanup().unwrap().affected, 0);

        f.clock.advance(ChronoDuration::seconds(61));
        assert_eq!(f.strategy().do_cleanup().unwrap().affected, 1);
        assert!(f.locks.running_jobs().unwrap().is_empty());
    }

    #[test]
    fn unparsable_holder_is_released() {
        let f = fixture();
        let meta = InMemoryJobMetaRepository::arc();
        let locks = JobLockService::new(meta.clone(), JobMutexGroups::default());
        meta.try_acquire_run_lock("garbage", "Import", &["Import".to_string()].into())
            .unwrap()
            .unwrap();

        let released =
            clear_dead_locks(f.repo.as_ref(), &locks, f.clock.now(), Duration::ZERO).unwrap();
        assert_eq!(released, vec!["Import".to_string()]);
    }
}
