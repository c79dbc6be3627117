use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use jobguard_core::{JobId, JobInfo, JobStatus};

use super::{CleanupReport, CleanupStrategy};
use crate::error::RepositoryError;
use crate::repository::{JobRepository, newest_first};

/// Keeps the newest `n` stopped jobs of every type plus the most recent
/// stopped OK job, even if it is older.
pub struct KeepLastJobs {
    repository: Arc<dyn JobRepository>,
    number_of_jobs_to_keep: usize,
    interval: Duration,
}

impl KeepLastJobs {
    pub const NAME: &'static str = "keep_last_jobs";

    pub fn new(repository: Arc<dyn JobRepository>, number_of_jobs_to_keep: usize) -> Self {
        info!(number_of_jobs_to_keep, "KeepLastJobs strategy configured");
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

impl CleanupStrategy for KeepLastJobs {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn do_cleanup(&self) -> Result<CleanupReport, RepositoryError> {
        let jobs = self.repository.find_all()?;
        let mut deleted = 0;
        for job_id in select_jobs_to_delete(&jobs, self.number_of_jobs_to_keep) {
            if self.repository.remove_if_stopped(job_id)? {
                deleted += 1;
            }
        }
        debug!(deleted, "old jobs deleted");
        Ok(CleanupReport::new(Self::NAME, deleted))
    }
}

/// Stopped jobs beyond the newest `keep` of their type, except the most
/// recent stopped OK job. Running jobs are never selected.
pub fn select_jobs_to_delete(jobs: &[JobInfo], keep: usize) -> Vec<JobId> {
    let mut by_type: BTreeMap<&str, Vec<&JobInfo>> = BTreeMap::new();
    for job in jobs.iter().filter(|j| j.is_stopped()) {
        by_type.entry(job.job_type.as_str()).or_default().push(job);
    }

    let mut selected = Vec::new();
    for executions in by_type.values_mut() {
        executions.sort_by(|a, b| newest_first(a, b));
        let last_ok = executions
            .iter()
            .find(|j| j.status == JobStatus::Ok)
            .map(|j| j.job_id);
        selected.extend(
            executions
                .iter()
                .skip(keep)
                .map(|j| j.job_id)
                .filter(|id| Some(*id) != last_ok),
        );
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryJobRepository;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use proptest::prelude::*;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn stopped(job_type: &str, minute: i64, status: JobStatus) -> JobInfo {
        let started = base() + ChronoDuration::minutes(minute);
        let mut job = JobInfo::new(JobId::new(), job_type, started, "host");
        job.stop(started + ChronoDuration::seconds(30), Some(status))
            .unwrap();
        job
    }

    #[test]
    fn keeps_newest_and_last_ok() {
        // Ten stopped jobs, oldest first; only the third oldest (the eighth
        // newest) is OK.
        let jobs: Vec<JobInfo> = (0..10)
            .map(|i| {
                let status = if i == 2 { JobStatus::Ok } else { JobStatus::Error };
                stopped("Import", i, status)
            })
            .collect();
        let repo = InMemoryJobRepository::arc();
        for job in &jobs {
            repo.create_or_update(job.clone()).unwrap();
        }

        let report = KeepLastJobs::new(repo.clone(), 3).do_cleanup().unwrap();

        assert_eq!(report.affected, 6);
        let mut surviving: Vec<JobId> = repo.find_all().unwrap().iter().map(|j| j.job_id).collect();
        surviving.sort();
        let mut expected = vec![jobs[9].job_id, jobs[8].job_id, jobs[7].job_id, jobs[2].job_id];
        expected.sort();
        assert_eq!(surviving, expected);
    }

    #[test]
    fn running_jobs_are_never_selected() {
        let mut jobs: Vec<JobInfo> = (0..5).map(|i| stopped("Import", i, JobStatus::Ok)).collect();
        let running = JobInfo::new(JobId::new(), "Import", base(), "host");
        jobs.push(running.clone());

        let selected = select_jobs_to_delete(&jobs, 1);
        assert_eq!(selected.len(), 4);
        assert!(!selected.contains(&running.job_id));
    }

    #[test]
    fn types_are_counted_separately() {
        let jobs = vec![
            stopped("Import", 0, JobStatus::Ok),
            stopped("Import", 1, JobStatus::Ok),
            stopped("Export", 0, JobStatus::Ok),
        ];
        let selected = select_jobs_to_delete(&jobs, 1);
        assert_eq!(selected, vec![jobs[0].job_id]);
    }

    fn arb_status() -> impl Strategy<Value = JobStatus> {
        prop_oneof![
            Just(JobStatus::Ok),
            Just(JobStatus::Error),
            Just(JobStatus::Dead),
            Just(JobStatus::Skipped),
        ]
    }

    proptest! {
        #[test]
        fn selection_is_deterministic_and_safe(
            specs in prop::collection::vec((0..3usize, 0i64..20, arb_status(), any::<bool>()), 0..40),
            keep in 0usize..6,
        ) {
            let types = ["A", "B", "C"];
            let jobs: Vec<JobInfo> = specs
                .iter()
                .map(|(t, minute, status, running)| {
                    if *running {
                        JobInfo::new(JobId::new(), types[*t], base() + ChronoDuration::minutes(*minute), "host")
                    } else {
                        stopped(types[*t], *minute, *status)
                    }
                })
                .collect();

            let mut first = select_jobs_to_delete(&jobs, keep);
            let mut reversed: Vec<JobInfo> = jobs.clone();
            reversed.reverse();
            let mut second = select_jobs_to_delete(&reversed, keep);
            first.sort();
            second.sort();
            prop_assert_eq!(&first, &second);

            for job_type in types {
                let mut stopped_of_type: Vec<&JobInfo> = jobs
                    .iter()
                    .filter(|j| j.job_type == job_type && j.is_stopped())
                    .collect();
                stopped_of_type.sort_by(|a, b| newest_first(a, b));

                for job in stopped_of_type.iter().take(keep) {
                    prop_assert!(!first.contains(&job.job_id));
                }
                if let Some(last_ok) = stopped_of_type.iter().find(|j| j.status == JobStatus::Ok) {
                    prop_assert!(!first.contains(&last_ok.job_id));
                }
            }
            for job in jobs.iter().filter(|j| !j.is_stopped()) {
                prop_assert!(!first.contains(&job.job_id));
            }
        }
    }
}
