use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use jobguard_core::{DomainError, JobId, JobInfo, JobMessage, JobStatus};

use super::r#trait::{JobRepository, newest_first};
use crate::error::RepositoryError;

/// In-memory job repository (for tests/dev and single-node deployments).
///
/// Every write runs under the map's write guard, so the per-field mutators are
/// atomic with respect to each other.
#[derive(Debug, Default)]
pub struct InMemoryJobRepository {
    jobs: RwLock<HashMap<JobId, JobInfo>>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn sorted<F>(&self, filter: F) -> Result<Vec<JobInfo>, RepositoryError>
    where
        F: Fn(&JobInfo) -> bool,
    {
        let jobs = self.jobs.read().map_err(RepositoryError::poisoned)?;
        let mut result: Vec<JobInfo> = jobs.values().filter(|j| filter(j)).cloned().collect();
        result.sort_by(newest_first);
        Ok(result)
    }

    fn update<T, F>(&self, job_id: JobId, f: F) -> Result<T, RepositoryError>
    where
        F: FnOnce(&mut JobInfo) -> Result<T, DomainError>,
    {
        let mut jobs = self.jobs.write().map_err(RepositoryError::poisoned)?;
        let job = jobs
            .get_mut(&job_id)
            .ok_or(RepositoryError::NotFound(job_id))?;
        // Mutate a copy so a rejected change leaves the stored record intact.
        let mut updated = job.clone();
        let out = f(&mut updated)?;
        *job = updated;
        Ok(out)
    }
}

impl JobRepository for InMemoryJobRepository {
    fn find_one(&self, job_id: JobId) -> Result<Option<JobInfo>, RepositoryError> {
        let jobs = self.jobs.read().map_err(RepositoryError::poisoned)?;
        Ok(jobs.get(&job_id).cloned())
    }

    fn find_all(&self) -> Result<Vec<JobInfo>, RepositoryError> {
        self.sorted(|_| true)
    }

    fn find_by_type(&self, job_type: &str) -> Result<Vec<JobInfo>, RepositoryError> {
        self.sorted(|j| j.job_type == job_type)
    }

    fn find_latest(&self, limit: usize) -> Result<Vec<JobInfo>, RepositoryError> {
        let mut result = self.find_all()?;
        result.truncate(limit);
        Ok(result)
    }

    fn find_latest_by(
        &self,
        job_type: &str,
        limit: usize,
    ) -> Result<Vec<JobInfo>, RepositoryError> {
        let mut result = self.find_by_type(job_type)?;
        result.truncate(limit);
        Ok(result)
    }

    fn find_latest_jobs_distinct(&self) -> Result<Vec<JobInfo>, RepositoryError> {
        let mut latest: BTreeMap<String, JobInfo> = BTreeMap::new();
        for job in self.find_all()? {
            latest.entry(job.job_type.clone()).or_insert(job);
        }
        let mut result: Vec<JobInfo> = latest.into_values().collect();
        result.sort_by(newest_first);
        Ok(result)
    }

    fn find_running_without_update_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<JobInfo>, RepositoryError> {
        self.sorted(|j| !j.is_stopped() && j.last_updated < since)
    }

    fn find_all_job_types(&self) -> Result<Vec<String>, RepositoryError> {
        let jobs = self.jobs.read().map_err(RepositoryError::poisoned)?;
        let mut types: Vec<String> = jobs.values().map(|j| j.job_type.clone()).collect();
        types.sort();
        types.dedup();
        Ok(types)
    }

    fn create_or_update(&self, job: JobInfo) -> Result<JobInfo, RepositoryError> {
        let mut jobs = self.jobs.write().map_err(RepositoryError::poisoned)?;
        if let Some(existing) = jobs.get(&job.job_id) {
            if existing.is_stopped() {
                return Err(RepositoryError::AlreadyStopped(job.job_id));
            }
        }
        jobs.insert(job.job_id, job.clone());
        Ok(job)
    }

    fn remove_if_stopped(&self, job_id: JobId) -> Result<bool, RepositoryError> {
        let mut jobs = self.jobs.write().map_err(RepositoryError::poisoned)?;
        match jobs.get(&job_id) {
            Some(job) if job.is_stopped() => {
                jobs.remove(&job_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn append_message(&self, job_id: JobId, message: JobMessage) -> Result<(), RepositoryError> {
        self.update(job_id, |job| job.append_message(message))
    }

    fn set_job_status(&self, job_id: JobId, status: JobStatus) -> Result<(), RepositoryError> {
        if status == JobStatus::Dead {
            return Err(DomainError::invariant("DEAD can only be set when stopping a job").into());
        }
        self.update(job_id, |job| match (job.status, status) {
            (JobStatus::Error, JobStatus::Skipped) => job.ensure_running(),
            _ => job.set_status(status),
        })
    }

    fn mark_skipped(&self, job_id: JobId, at: DateTime<Utc>) -> Result<(), RepositoryError> {
        self.update(job_id, |job| job.mark_skipped(at))
    }

    fn mark_restarted(&self, job_id: JobId, at: DateTime<Utc>) -> Result<(), RepositoryError> {
        self.update(job_id, |job| job.mark_restarted(at))
    }

    fn set_last_update(&self, job_id: JobId, at: DateTime<Utc>) -> Result<(), RepositoryError> {
        self.update(job_id, |job| job.ping(at))
    }

    fn stop_job(
        &self,
        job_id: JobId,
        at: DateTime<Utc>,
        status: Option<JobStatus>,
    ) -> Result<JobInfo, RepositoryError> {
        self.update(job_id, |job| {
            job.stop(at, status)?;
            Ok(job.clone())
        })
    }

    fn truncate_messages(
        &self,
        job_id: JobId,
        keep_last: usize,
        note: JobMessage,
    ) -> Result<(), RepositoryError> {
        self.update(job_id, |job| job.truncate_messages(keep_last, note))
    }

    fn count(&self) -> Result<usize, RepositoryError> {
        let jobs = self.jobs.read().map_err(RepositoryError::poisoned)?;
        Ok(jobs.len())
    }

    fn clear_all(&self) -> Result<(), RepositoryError> {
        let mut jobs = self.jobs.write().map_err(RepositoryError::poisoned)?;
        jobs.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use jobguard_core::Level;
    use jobguard_core::job_info::RESTART_MESSAGE;

    fn job_at(job_type: &str, started: DateTime<Utc>) -> JobInfo {
        JobInfo::new(JobId::new(), job_type, started, "host-1")
    }

    #[test]
    fn lists_are_newest_first() {
        let repo = InMemoryJobRepository::new();
        let now = Utc::now();
        let old = repo
            .create_or_update(job_at("A", now - Duration::seconds(20)))
            .unwrap();
        let mid = repo
            .create_or_update(job_at("B", now - Duration::seconds(10)))
            .unwrap();
        let new = repo.create_or_update(job_at("A", now)).unwrap();

        let ids: Vec<_> = repo.find_all().unwrap().into_iter().map(|j| j.job_id).collect();
        assert_eq!(ids, vec![new.job_id, mid.job_id, old.job_id]);

        let latest_a = repo.find_latest_by("A", 1).unwrap();
        assert_eq!(latest_a.len(), 1);
        assert_eq!(latest_a[0].job_id, new.job_id);

        let distinct = repo.find_latest_jobs_distinct().unwrap();
        assert_eq!(distinct.len(), 2);
        assert_eq!(distinct[0].job_id, new.job_id);
        assert_eq!(distinct[1].job_id, mid.job_id);

        assert_eq!(repo.find_all_job_types().unwrap(), vec!["A", "B"]);
    }

    #[test]
    fn equal_start_times_order_by_id() {
        let repo = InMemoryJobRepository::new();
        let now = Utc::now();
        let a = repo.create_or_update(job_at("A", now)).unwrap();
        let b = repo.create_or_update(job_at("A", now)).unwrap();

        let ids: Vec<_> = repo.find_all().unwrap().into_iter().map(|j| j.job_id).collect();
        let mut expected = vec![a.job_id, b.job_id];
        expected.sort();
        expected.reverse();
        assert_eq!(ids, expected);
    }

    #[test]
    fn remove_if_stopped_keeps_running_jobs() {
        let repo = InMemoryJobRepository::new();
        let job = repo.create_or_update(job_at("A", Utc::now())).unwrap();

        assert!(!repo.remove_if_stopped(job.job_id).unwrap());
        assert!(repo.find_one(job.job_id).unwrap().is_some());

        repo.stop_job(job.job_id, Utc::now(), None).unwrap();
        assert!(repo.remove_if_stopped(job.job_id).unwrap());
        assert!(repo.find_one(job.job_id).unwrap().is_none());
    }

    #[test]
    fn stopped_records_reject_writes() {
        let repo = InMemoryJobRepository::new();
        let job = repo.create_or_update(job_at("A", Utc::now())).unwrap();
        let stopped = repo.stop_job(job.job_id, Utc::now(), None).unwrap();

        let later = Utc::now() + Duration::seconds(5);
        assert_eq!(
            repo.append_message(job.job_id, JobMessage::info("late", later)),
            Err(RepositoryError::AlreadyStopped(job.job_id))
        );
        assert!(repo.set_last_update(job.job_id, later).is_err());
        assert!(repo.set_job_status(job.job_id, JobStatus::Error).is_err());
        assert!(repo.create_or_update(job.clone()).is_err());

        assert_eq!(repo.find_one(job.job_id).unwrap(), Some(stopped));
    }

    #[test]
    fn error_message_flips_status() {
        let repo = InMemoryJobRepository::new();
        let job = repo.create_or_update(job_at("A", Utc::now())).unwrap();

        repo.append_message(job.job_id, JobMessage::new(Level::Error, "boom", Utc::now()))
            .unwrap();

        let stored = repo.find_one(job.job_id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Error);
        assert_eq!(stored.messages.len(), 1);

        repo.set_job_status(job.job_id, JobStatus::Skipped).unwrap();
        let stored = repo.find_one(job.job_id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Error);
    }

    #[test]
    fn error_only_reverts_through_restart() {
        let repo = InMemoryJobRepository::new();
        let job = repo.create_or_update(job_at("A", Utc::now())).unwrap();
        repo.append_message(job.job_id, JobMessage::error("boom", Utc::now()))
            .unwrap();

        assert!(matches!(
            repo.set_job_status(job.job_id, JobStatus::Ok),
            Err(RepositoryError::Domain(DomainError::Conflict(_)))
        ));
        assert_eq!(
            repo.find_one(job.job_id).unwrap().unwrap().status,
            JobStatus::Error
        );

        repo.mark_skipped(job.job_id, Utc::now()).unwrap();
        assert_eq!(
            repo.find_one(job.job_id).unwrap().unwrap().status,
            JobStatus::Error
        );

        repo.mark_restarted(job.job_id, Utc::now()).unwrap();
        let stored = repo.find_one(job.job_id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Ok);
        assert_eq!(stored.messages.last().unwrap().message, RESTART_MESSAGE);
        assert_eq!(stored.messages.last().unwrap().level, Level::Warning);
    }

    #[test]
    fn finds_running_jobs_without_recent_update() {
        let repo = InMemoryJobRepository::new();
        let now = Utc::now();
        let stale = repo
            .create_or_update(job_at("A", now - Duration::seconds(120)))
            .unwrap();
        let fresh = repo.create_or_update(job_at("B", now)).unwrap();
        let stopped = repo
            .create_or_update(job_at("C", now - Duration::seconds(120)))
            .unwrap();
        repo.stop_job(stopped.job_id, now - Duration::seconds(100), None)
            .unwrap();

        let found = repo
            .find_running_without_update_since(now - Duration::seconds(60))
            .unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].job_id, stale.job_id);
        assert!(found.iter().all(|j| j.job_id != fresh.job_id));
    }

    #[test]
    fn dead_only_through_stop() {
        let repo = InMemoryJobRepository::new();
        let job = repo.create_or_update(job_at("A", Utc::now())).unwrap();

        assert!(matches!(
            repo.set_job_status(job.job_id, JobStatus::Dead),
            Err(RepositoryError::Domain(DomainError::InvariantViolation(_)))
        ));
        let stopped = repo
            .stop_job(job.job_id, Utc::now(), Some(JobStatus::Dead))
            .unwrap();
        assert_eq!(stopped.status, JobStatus::Dead);
    }

    #[test]
    fn missing_job_is_not_found() {
        let repo = InMemoryJobRepository::new();
        let id = JobId::new();
        assert_eq!(
            repo.set_last_update(id, Utc::now()),
            Err(RepositoryError::NotFound(id))
        );
        assert_eq!(repo.count().unwrap(), 0);
    }
}
