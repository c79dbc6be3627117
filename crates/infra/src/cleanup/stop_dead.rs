use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use jobguard_core::job_info::DEAD_MESSAGE;
use jobguard_core::{Clock, DomainError, JobId, JobMessage, JobStatus};

use super::{CleanupReport, CleanupStrategy};
use crate::error::RepositoryError;
use crate::repository::JobRepository;

/// Stops running jobs whose heartbeat is older than the threshold as DEAD.
///
/// Run locks stay in place; [`super::ClearDeadLocks`] frees them once the
/// record is stopped.
pub struct StopDeadJobs {
    repository: Arc<dyn JobRepository>,
    clock: Arc<dyn Clock>,
    mark_dead_after: Duration,
    interval: Duration,
}

impl StopDeadJobs {
    pub const NAME: &'static str = "stop_dead_jobs";

    pub fn new(
        repository: Arc<dyn JobRepository>,
        clock: Arc<dyn Clock>,
        mark_dead_after: Duration,
    ) -> Self {
        info!(
            mark_dead_after_secs = mark_dead_after.as_secs(),
            "Mark old jobs as stopped after inactivity"
        );
        Self {
            repository,
            clock,
            mark_dead_after,
            interval: Duration::from_secs(60),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

impl CleanupStrategy for StopDeadJobs {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn do_cleanup(&self) -> Result<CleanupReport, RepositoryError> {
        let stopped = stop_dead_jobs(
            self.repository.as_ref(),
            self.clock.now(),
            self.mark_dead_after,
        )?;
        Ok(CleanupReport::new(Self::NAME, stopped.len()))
    }
}

/// Mark every running job without an update since `now - threshold` as DEAD.
///
/// Jobs that finish on their own in the meantime are left alone.
pub fn stop_dead_jobs(
    repository: &dyn JobRepository,
    now: DateTime<Utc>,
    threshold: Duration,
) -> Result<Vec<JobId>, RepositoryError> {
    let threshold = chrono::Duration::from_std(threshold)
        .map_err(|e| DomainError::validation(format!("dead job threshold out of range: {e}")))?;
    let since = now - threshold;
    debug!(since = %since, "looking for jobs without recent updates");

    let mut stopped = Vec::new();
    for job in repository.find_running_without_update_since(since)? {
        let result = repository
            .append_message(job.job_id, JobMessage::warning(DEAD_MESSAGE, now))
            .and_then(|()| repository.stop_job(job.job_id, now, Some(JobStatus::Dead)));
        match result {
            Ok(_) => {
                warn!(
                    job_type = %job.job_type,
                    job_id = %job.job_id,
                    last_updated = %job.last_updated,
                    "job marked dead"
                );
                stopped.push(job.job_id);
            }
            Err(RepositoryError::AlreadyStopped(_) | RepositoryError::NotFound(_)) => {
                debug!(job_id = %job.job_id, "job stopped before it could be marked dead");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(stopped)
}
