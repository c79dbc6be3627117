//! Store-level error model shared by the job and meta repositories.

use jobguard_core::{DomainError, JobId};

/// Failure reported by a [`JobRepository`](crate::repository::JobRepository) or
/// [`JobMetaRepository`](crate::meta::JobMetaRepository).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    /// The backing store could not be reached or failed to execute the operation.
    #[error("repository unavailable: {0}")]
    Unavailable(String),

    /// The job record is stopped; the write was rejected and nothing changed.
    #[error("job {0} is already stopped")]
    AlreadyStopped(JobId),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Domain(DomainError),
}

impl RepositoryError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Heartbeats and sweeps skip a tick on these and try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RepositoryError::Unavailable(_))
    }

    /// Lock poisoning means a writer panicked mid-update.
    pub(crate) fn poisoned<T>(_: std::sync::PoisonError<T>) -> Self {
        Self::Unavailable("lock poisoned".to_string())
    }
}

impl From<DomainError> for RepositoryError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::AlreadyStopped(id) => RepositoryError::AlreadyStopped(id),
            other => RepositoryError::Domain(other),
        }
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(value: serde_json::Error) -> Self {
        RepositoryError::Serialization(value.to_string())
    }
}
