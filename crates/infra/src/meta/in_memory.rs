use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use jobguard_core::meta::{KEY_DISABLED, KEY_RUNNING, check_meta_key};
use jobguard_core::{BlockReason, JobMeta, RunningJob};

use super::r#trait::JobMetaRepository;
use crate::error::RepositoryError;

type Document = BTreeMap<String, String>;

/// In-memory meta repository.
///
/// All documents sit behind one lock; group acquisition checks and writes
/// under a single write guard, which makes it linearizable across every type
/// of the group.
#[derive(Debug, Default)]
pub struct InMemoryJobMetaRepository {
    documents: RwLock<HashMap<String, Document>>,
}

impl InMemoryJobMetaRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn write_key(
        &self,
        job_type: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<Option<String>, RepositoryError> {
        let mut documents = self.documents.write().map_err(RepositoryError::poisoned)?;
        let previous = match value {
            Some(value) => documents
                .entry(job_type.to_string())
                .or_default()
                .insert(key.to_string(), value.to_string()),
            None => {
                let previous = documents
                    .get_mut(job_type)
                    .and_then(|doc| doc.remove(key));
                if documents.get(job_type).is_some_and(BTreeMap::is_empty) {
                    documents.remove(job_type);
                }
                previous
            }
        };
        Ok(previous)
    }
}

impl JobMetaRepository for InMemoryJobMetaRepository {
    fn get_value(&self, job_type: &str, key: &str) -> Result<Option<String>, RepositoryError> {
        let documents = self.documents.read().map_err(RepositoryError::poisoned)?;
        Ok(documents.get(job_type).and_then(|doc| doc.get(key)).cloned())
    }

    fn set_value(
        &self,
        job_type: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<Option<String>, RepositoryError> {
        check_meta_key(key)?;
        self.write_key(job_type, key, value)
    }

    fn create_value(
        &self,
        job_type: &str,
        key: &str,
        value: &str,
    ) -> Result<bool, RepositoryError> {
        check_meta_key(key)?;
        let mut documents = self.documents.write().map_err(RepositoryError::poisoned)?;
        let doc = documents.entry(job_type.to_string()).or_default();
        if doc.contains_key(key) {
            return Ok(false);
        }
        doc.insert(key.to_string(), value.to_string());
        Ok(true)
    }

    fn find_all_job_types(&self) -> Result<BTreeSet<String>, RepositoryError> {
        let documents = self.documents.read().map_err(RepositoryError::poisoned)?;
        Ok(documents.keys().cloned().collect())
    }

    fn get_job_meta(&self, job_type: &str) -> Result<JobMeta, RepositoryError> {
        let documents = self.documents.read().map_err(RepositoryError::poisoned)?;
        Ok(match documents.get(job_type) {
            Some(doc) => JobMeta::from_document(job_type, doc),
            None => JobMeta::empty(job_type),
        })
    }

    fn try_acquire_run_lock(
        &self,
        job_id: &str,
        job_type: &str,
        mutex_types: &BTreeSet<String>,
    ) -> Result<Result<(), BlockReason>, RepositoryError> {
        let mut documents = self.documents.write().map_err(RepositoryError::poisoned)?;

        if let Some(doc) = documents.get(job_type) {
            if let Some(comment) = doc.get(KEY_DISABLED) {
                return Ok(Err(BlockReason::Disabled {
                    job_type: job_type.to_string(),
                    comment: comment.clone(),
                }));
            }
            if let Some(holder) = doc.get(KEY_RUNNING) {
                return Ok(Err(BlockReason::AlreadyRunning {
                    job_type: job_type.to_string(),
                    job_id: holder.clone(),
                }));
            }
        }

        let blocked_by = mutex_types
            .iter()
            .filter(|other| other.as_str() != job_type)
            .find(|other| {
                documents
                    .get(other.as_str())
                    .is_some_and(|doc| doc.contains_key(KEY_RUNNING))
            });
        if let Some(blocked_by) = blocked_by {
            return Ok(Err(BlockReason::MutexGroup {
                job_type: job_type.to_string(),
                blocked_by: blocked_by.clone(),
            }));
        }

        documents
            .entry(job_type.to_string())
            .or_default()
            .insert(KEY_RUNNING.to_string(), job_id.to_string());
        Ok(Ok(()))
    }

    fn release_run_lock(&self, job_type: &str) -> Result<(), RepositoryError> {
        self.write_key(job_type, KEY_RUNNING, None)?;
        Ok(())
    }

    fn release_run_lock_held_by(
        &self,
        job_type: &str,
        job_id: &str,
    ) -> Result<bool, RepositoryError> {
        let mut documents = self.documents.write().map_err(RepositoryError::poisoned)?;
        let Some(doc) = documents.get_mut(job_type) else {
            return Ok(false);
        };
        if doc.get(KEY_RUNNING).map(String::as_str) != Some(job_id) {
            return Ok(false);
        }
        doc.remove(KEY_RUNNING);
        if doc.is_empty() {
            documents.remove(job_type);
        }
        Ok(true)
    }

    fn running_job(&self, job_type: &str) -> Result<Option<RunningJob>, RepositoryError> {
        Ok(self
            .get_value(job_type, KEY_RUNNING)?
            .map(|job_id| RunningJob::new(job_id, job_type)))
    }

    fn disable(&self, job_type: &str, comment: &str) -> Result<(), RepositoryError> {
        self.write_key(job_type, KEY_DISABLED, Some(comment))?;
        Ok(())
    }

    fn enable(&self, job_type: &str) -> Result<(), RepositoryError> {
        self.write_key(job_type, KEY_DISABLED, None)?;
        Ok(())
    }

    fn delete_all(&self) -> Result<(), RepositoryError> {
        let mut documents = self.documents.write().map_err(RepositoryError::poisoned)?;
        documents.clear();
        Ok(())
    }
}
