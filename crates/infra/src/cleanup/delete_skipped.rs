use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use jobguard_core::{JobId, JobInfo, JobStatus};

use super::{CleanupReport, CleanupStrategy};
use crate::error::RepositoryError;
use crate::repository::{JobRepository, newest_first};

/// Keeps the newest `n` stopped SKIPPED jobs of every type.
pub struct DeleteSkippedJobs {
    repository: Arc<dyn JobRepository>,
    number_of_jobs_to_keep: usize,
    interval: Duration,
}

impl DeleteSkippedJobs {
    pub const NAME: &'static str = "delete_skipped_jobs";

    pub fn new(repository: Arc<dyn JobRepository>, number_of_jobs_to_keep: usize) -> Self {
        info!(number_of_jobs_to_keep, "DeleteSkippedJobs strategy configured");
        Self {
            repository,
            number_of_jobs_to_keep,
            interval: Duration::from_secs(10 * 60),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

impl CleanupStrategy for DeleteSkippedJobs {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn do_cleanup(&self) -> Result<CleanupReport, RepositoryError> {
        let jobs: Vec<JobInfo> = self
            .repository
            .find_all()?
            .iter()
            .map(JobInfo::without_messages)
            .collect();
        let mut deleted = 0;
        for job_id in select_skipped_jobs_to_delete(&jobs, self.number_of_jobs_to_keep) {
            if self.repository.remove_if_stopped(job_id)? {
                deleted += 1;
            }
        }
        debug!(deleted, "skipped jobs deleted");
        Ok(CleanupReport::new(Self::NAME, deleted))
    }
}

pub fn select_skipped_jobs_to_delete(jobs: &[JobInfo], keep: usize) -> Vec<JobId> {
    let mut by_type: BTreeMap<&str, Vec<&JobInfo>> = BTreeMap::new();
    for job in jobs
        .iter()
        .filter(|j| j.is_stopped() && j.status == JobStatus::Skipped)
    {
        by_type.entry(job.job_type.as_str()).or_default().push(job);
    }

    by_type
        .values_mut()
        .flat_map(|executions| {
            executions.sort_by(|a, b| newest_first(a, b));
            executions.iter().skip(keep).map(|j| j.job_id).collect::<Vec<_>>()
        })
        .collect()
}
