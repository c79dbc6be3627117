//! Periodic housekeeping over job records and run locks.
//!
//! Each strategy is a selection step (pure, over a snapshot of records) plus
//! the repository writes that apply it. Strategies run independently; one
//! failing never stops the others.

pub mod clear_dead_locks;
pub mod delete_skipped;
pub mod keep_last;
pub mod stop_dead;
pub mod too_big_logs;

use std::sync::Arc;
use std::time::Duration;

use jobguard_core::Clock;

use crate::config::CleanupConfig;
use crate::error::RepositoryError;
use crate::lock::JobLockService;
use crate::repository::JobRepository;

pub use clear_dead_locks::ClearDeadLocks;
pub use delete_skipped::DeleteSkippedJobs;
pub use keep_last::KeepLastJobs;
pub use stop_dead::StopDeadJobs;
pub use too_big_logs::CleanupMessagesOfTooBigJobLogs;

/// What one cleanup pass changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub strategy: &'static str,
    /// Records deleted, stopped or truncated, or locks released.
    pub affected: usize,
}

impl CleanupReport {
    pub fn new(strategy: &'static str, affected: usize) -> Self {
        Self { strategy, affected }
    }
}

pub trait CleanupStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fixed rate between two passes.
    fn interval(&self) -> Duration;

    fn do_cleanup(&self) -> Result<CleanupReport, RepositoryError>;
}

impl<S: CleanupStrategy + ?Sized> CleanupStrategy for Arc<S> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn interval(&self) -> Duration {
        (**self).interval()
    }

    fn do_cleanup(&self) -> Result<CleanupReport, RepositoryError> {
        (**self).do_cleanup()
    }
}

/// The five standard strategies, configured from `config`.
pub fn default_strategies(
    repository: Arc<dyn JobRepository>,
    locks: JobLockService,
    clock: Arc<dyn Clock>,
    config: &CleanupConfig,
) -> Vec<Arc<dyn CleanupStrategy>> {
    vec![
        Arc::new(
            KeepLastJobs::new(repository.clone(), config.number_of_jobs_to_keep)
                .with_interval(config.keep_last_interval),
        ),
        Arc::new(
            DeleteSkippedJobs::new(repository.clone(), config.number_of_skipped_jobs_to_keep)
                .with_interval(config.delete_skipped_interval),
        ),
        Arc::new(
            StopDeadJobs::new(repository.clone(), clock.clone(), config.mark_dead_after)
                .with_interval(config.stop_dead_interval),
        ),
        Arc::new(
            ClearDeadLocks::new(repository.clone(), locks, clock.clone())
                .with_interval(config.clear_locks_interval),
        ),
        Arc::new(
            CleanupMessagesOfTooBigJobLogs::new(repository, clock)
                .with_limits(config.max_log_bytes, config.keep_log_messages)
                .with_interval(config.too_big_logs_interval),
        ),
    ]
}
