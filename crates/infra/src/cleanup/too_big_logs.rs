use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use jobguard_core::job_info::TRUNCATED_MESSAGE;
use jobguard_core::{Clock, JobId, JobInfo, JobMessage};

use super::{CleanupReport, CleanupStrategy};
use crate::config::DEFAULT_MAX_LOG_BYTES;
use crate::error::RepositoryError;
use crate::repository::JobRepository;

/// Shrinks the message log of running jobs that grew beyond `max_log_bytes`
/// to the last `keep_last` messages, the last one being a truncation note.
pub struct CleanupMessagesOfTooBigJobLogs {
    repository: Arc<dyn JobRepository>,
    clock: Arc<dyn Clock>,
    max_log_bytes: usize,
    keep_last: usize,
    interval: Duration,
}

impl CleanupMessagesOfTooBigJobLogs {
    pub const NAME: &'static str = "cleanup_too_big_job_logs";

    pub fn new(repository: Arc<dyn JobRepository>, clock: Arc<dyn Clock>) -> Self {
        Self {
            repository,
            clock,
            max_log_bytes: DEFAULT_MAX_LOG_BYTES,
            keep_last: 1000,
            interval: Duration::from_secs(10 * 60),
        }
    }

    pub fn with_limits(mut self, max_log_bytes: usize, keep_last: usize) -> Self {
        self.max_log_bytes = max_log_bytes;
        self.keep_last = keep_last;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

impl CleanupStrategy for CleanupMessagesOfTooBigJobLogs {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn do_cleanup(&self) -> Result<CleanupReport, RepositoryError> {
        let jobs = self.repository.find_all()?;
        let mut truncated = 0;
        for job_id in select_too_big_logs(&jobs, self.max_log_bytes) {
            let note = JobMessage::info(TRUNCATED_MESSAGE, self.clock.now());
            match self
                .repository
                .truncate_messages(job_id, self.keep_last, note)
            {
                Ok(()) => {
                    warn!(job_id = %job_id, keep_last = self.keep_last, "job log truncated");
                    truncated += 1;
                }
                Err(RepositoryError::AlreadyStopped(_) | RepositoryError::NotFound(_)) => {
                    debug!(job_id = %job_id, "job stopped before its log could be truncated");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(CleanupReport::new(Self::NAME, truncated))
    }
}

/// Running jobs whose estimated log size exceeds `max_log_bytes`.
///
/// Stopped records are immutable, so a stopped log stays at its size at stop
/// time: at most `max_log_bytes` plus whatever the job wrote during the last
/// cleanup interval.
pub fn select_too_big_logs(jobs: &[JobInfo], max_log_bytes: usize) -> Vec<JobId> {
    jobs.iter()
        .filter(|j| !j.is_stopped() && j.estimated_log_size() > max_log_bytes)
        .map(|j| j.job_id)
        .collect()
}
