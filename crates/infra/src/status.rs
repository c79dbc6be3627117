//! Health summary of a job type derived from its latest executions.
//!
//! Purely informational: nothing here stops or starts jobs.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::error;

use jobguard_core::{Clock, DomainError, JobDefinition, JobInfo, JobStatus};

use crate::error::RepositoryError;
use crate::meta::JobMetaRepository;
use crate::repository::JobRepository;

pub const SUCCESS_MESSAGE: &str = "Last job was successful";
pub const ERROR_MESSAGE: &str = "Job had an error";
pub const DIED_MESSAGE: &str = "Job died";
pub const LOAD_JOBS_FAILED_MESSAGE: &str = "Failed to load job status";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Ok,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusDetail {
    pub name: String,
    pub status: HealthStatus,
    pub message: String,
    /// URI of the execution the status was derived from.
    pub job_uri: Option<String>,
    pub details: BTreeMap<String, String>,
}

impl StatusDetail {
    fn new(name: &str, status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            message: message.into(),
            job_uri: None,
            details: BTreeMap::new(),
        }
    }
}

/// Rates the newest `number_of_jobs` executions of a type, accepting up to
/// `max_failed_jobs` failures.
pub struct JobStatusCalculator {
    key: String,
    number_of_jobs: usize,
    max_failed_jobs: usize,
    repository: Arc<dyn JobRepository>,
    meta: Arc<dyn JobMetaRepository>,
    clock: Arc<dyn Clock>,
}

impl JobStatusCalculator {
    pub fn new(
        key: impl Into<String>,
        number_of_jobs: usize,
        max_failed_jobs: usize,
        repository: Arc<dyn JobRepository>,
        meta: Arc<dyn JobMetaRepository>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, DomainError> {
        let key = key.into();
        if key.is_empty() {
            return Err(DomainError::validation("key must not be empty"));
        }
        if number_of_jobs == 0 {
            return Err(DomainError::validation("number_of_jobs must be greater than zero"));
        }
        if max_failed_jobs > number_of_jobs {
            return Err(DomainError::validation(
                "max_failed_jobs must not be greater than number_of_jobs",
            ));
        }
        Ok(Self {
            key,
            number_of_jobs,
            max_failed_jobs,
            repository,
            meta,
            clock,
        })
    }

    /// WARNING when the last job failed.
    pub fn warning_on_last_job_failed(
        key: impl Into<String>,
        repository: Arc<dyn JobRepository>,
        meta: Arc<dyn JobMetaRepository>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, DomainError> {
        Self::new(key, 1, 1, repository, meta, clock)
    }

    /// ERROR when the last job failed.
    pub fn error_on_last_job_failed(
        key: impl Into<String>,
        repository: Arc<dyn JobRepository>,
        meta: Arc<dyn JobMetaRepository>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, DomainError> {
        Self::new(key, 1, 0, repository, meta, clock)
    }

    /// ERROR when each of the last `n` jobs failed.
    pub fn error_on_last_num_jobs_failed(
        key: impl Into<String>,
        n: usize,
        repository: Arc<dyn JobRepository>,
        meta: Arc<dyn JobMetaRepository>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, DomainError> {
        Self::new(key, n, n.saturating_sub(1), repository, meta, clock)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn status_detail(&self, definition: &JobDefinition) -> StatusDetail {
        match self.try_status_detail(definition) {
            Ok(detail) => detail,
            Err(e) => {
                error!(job_type = %definition.job_type(), error = %e, "{LOAD_JOBS_FAILED_MESSAGE}");
                StatusDetail::new(
                    definition.job_name(),
                    HealthStatus::Error,
                    LOAD_JOBS_FAILED_MESSAGE,
                )
            }
        }
    }

    fn try_status_detail(&self, definition: &JobDefinition) -> Result<StatusDetail, RepositoryError> {
        let jobs = self
            .repository
            .find_latest_by(definition.job_type(), self.number_of_jobs + 1)?;
        let Some(current) = jobs.first() else {
            return Ok(StatusDetail::new(
                definition.job_name(),
                HealthStatus::Ok,
                SUCCESS_MESSAGE,
            ));
        };
        // A job that is running fine says nothing yet; rate the one before.
        let last = if !current.is_stopped() && current.status == JobStatus::Ok && jobs.len() > 1 {
            &jobs[1]
        } else {
            current
        };
        let meta = self.meta.get_job_meta(definition.job_type())?;
        let failed = jobs.iter().filter(|j| j.status == JobStatus::Error).count();
        let too_many_failed = || format!("{failed} out of {} job executions failed", jobs.len());

        let (status, message) = if meta.is_disabled() {
            (
                HealthStatus::Ok,
                format!("Job is deactivated: {}", meta.disabled_comment()),
            )
        } else {
            match last.status {
                JobStatus::Ok | JobStatus::Skipped => {
                    if self.too_old(last, definition) {
                        let age = definition
                            .max_age()
                            .map(|a| format!("{} seconds", a.as_secs()))
                            .unwrap_or_else(|| "N/A".to_string());
                        (HealthStatus::Warning, format!("Job didn't run in the past {age}"))
                    } else if failed > self.max_failed_jobs {
                        (HealthStatus::Warning, too_many_failed())
                    } else {
                        (HealthStatus::Ok, SUCCESS_MESSAGE.to_string())
                    }
                }
                JobStatus::Error => {
                    let status = if failed > self.max_failed_jobs {
                        HealthStatus::Error
                    } else {
                        HealthStatus::Warning
                    };
                    if self.number_of_jobs == 1 && self.max_failed_jobs <= 1 {
                        (status, ERROR_MESSAGE.to_string())
                    } else {
                        (status, too_many_failed())
                    }
                }
                JobStatus::Dead => (HealthStatus::Warning, DIED_MESSAGE.to_string()),
            }
        };

        let mut detail = StatusDetail::new(definition.job_name(), status, message);
        detail.job_uri = Some(last.job_id.uri());
        detail.details = running_details(last);
        Ok(detail)
    }

    fn too_old(&self, job: &JobInfo, definition: &JobDefinition) -> bool {
        match (job.stopped, definition.max_age()) {
            (Some(stopped), Some(max_age)) => chrono::Duration::from_std(max_age)
                .map(|max_age| stopped + max_age < self.clock.now())
                .unwrap_or(false),
            _ => false,
        }
    }
}

fn running_details(job: &JobInfo) -> BTreeMap<String, String> {
    let mut details = BTreeMap::new();
    details.insert("Started".to_string(), job.started.to_rfc3339());
    if let Some(stopped) = job.stopped {
        details.insert("Stopped".to_string(), stopped.to_rfc3339());
    }
    details
}

impl std::fmt::Debug for JobStatusCalculator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStatusCalculator")
            .field("key", &self.key)
            .field("number_of_jobs", &self.number_of_jobs)
            .field("max_failed_jobs", &self.max_failed_jobs)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::InMemoryJobMetaRepository;
    use crate::repository::InMemoryJobRepository;
    use chrono::{Duration as ChronoDuration, Utc};
    use jobguard_core::{FixedClock, JobId};
    use std::time::Duration;

    struct Fixture {
        repo: Arc<InMemoryJobRepository>,
        meta: Arc<InMemoryJobMetaRepository>,
        clock: Arc<FixedClock>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                repo: InMemoryJobRepository::arc(),
                meta: InMemoryJobMetaRepository::arc(),
                clock: Arc::new(FixedClock::new(Utc::now())),
            }
        }

        fn job(&self, minutes_ago: i64, status: Option<JobStatus>) -> JobInfo {
            let started = self.clock.now() - ChronoDuration::minutes(minutes_ago);
            let mut job = JobInfo::new(JobId::new(), "Import", started, "h");
            if let Some(status) = status {
                job.stop(started + ChronoDuration::seconds(10), Some(status))
                    .unwrap();
            }
            self.repo.create_or_update(job.clone()).unwrap();
            job
        }

        fn calculator(&self, number_of_jobs: usize, max_failed: usize) -> JobStatusCalculator {
            JobStatusCalculator::new(
                "test",
                number_of_jobs,
                max_failed,
                self.repo.clone(),
                self.meta.clone(),
                self.clock.clone(),
            )
            .unwrap()
        }
    }

    fn definition() -> JobDefinition {
        JobDefinition::builder("Import")
            .name("Import feed")
            .max_age(Duration::from_secs(3600))
            .build()
            .unwrap()
    }

    #[test]
    fn no_jobs_is_ok() {
        let f = Fixture::new();
        let detail = f.calculator(1, 0).status_detail(&definition());
        assert_eq!(detail.status, HealthStatus::Ok);
        assert_eq!(detail.name, "Import feed");
    }

    #[test]
    fn last_job_failed() {
        let f = Fixture::new();
        let failed = f.job(5, Some(JobStatus::Error));

        let detail = f.calculator(1, 0).status_detail(&definition());
        assert_eq!(detail.status, HealthStatus::Error);
        assert_eq!(detail.message, ERROR_MESSAGE);
        assert_eq!(detail.job_uri, Some(failed.job_id.uri()));

        let detail = f.calculator(1, 1).status_detail(&definition());
        assert_eq!(detail.status, HealthStatus::Warning);
    }

    #[test]
    fn running_job_rates_previous_one() {
        let f = Fixture::new();
        f.job(30, Some(JobStatus::Dead));
        f.job(0, None);

        let detail = f.calculator(1, 0).status_detail(&definition());
        assert_eq!(detail.status, HealthStatus::Warning);
        assert_eq!(detail.message, DIED_MESSAGE);
    }

    #[test]
    fn too_old_job_warns() {
        let f = Fixture::new();
        f.job(120, Some(JobStatus::Ok));

        let detail = f.calculator(1, 0).status_detail(&definition());
        assert_eq!(detail.status, HealthStatus::Warning);
        assert_eq!(detail.message, "Job didn't run in the past 3600 seconds");
        assert!(detail.details.contains_key("Stopped"));
    }

    #[test]
    fn disabled_job_is_ok() {
        let f = Fixture::new();
        f.job(5, Some(JobStatus::Error));
        f.meta.disable("Import", "feed offline").unwrap();

        let detail = f.calculator(1, 0).status_detail(&definition());
        assert_eq!(detail.status, HealthStatus::Ok);
        assert_eq!(detail.message, "Job is deactivated: feed offline");
    }

    #[test]
    fn counts_failures_over_window() {
        let f = Fixture::new();
        f.job(30, Some(JobStatus::Error));
        f.job(20, Some(JobStatus::Error));
        f.job(10, Some(JobStatus::Error));

        let detail = f.calculator(3, 2).status_detail(&definition());
        assert_eq!(detail.status, HealthStatus::Error);
        assert_eq!(detail.message, "3 out of 3 job executions failed");
    }

    #[test]
    fn rejects_invalid_parameters() {
        let f = Fixture::new();
        assert!(
            JobStatusCalculator::new("", 1, 0, f.repo.clone(), f.meta.clone(), f.clock.clone())
                .is_err()
        );
        assert!(
            JobStatusCalculator::new("k", 1, 2, f.repo.clone(), f.meta.clone(), f.clock.clone())
                .is_err()
        );
    }
}
