//! Message and state-change handle handed to an executing job.

use tracing::{debug, error, info, warn};

use jobguard_core::{JobId, JobMessage, Level};

use crate::error::RepositoryError;
use crate::service::JobService;

/// Writes messages and state changes of one execution.
///
/// Calls are made from the executing thread. A failed write is logged and
/// swallowed: a job never fails because its progress could not be recorded.
#[derive(Debug, Clone)]
pub struct JobEventPublisher {
    service: JobService,
    job_id: JobId,
    job_type: String,
}

impl JobEventPublisher {
    pub(crate) fn new(service: JobService, job_id: JobId, job_type: impl Into<String>) -> Self {
        Self {
            service,
            job_id,
            job_type: job_type.into(),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        info!(job_id = %self.job_id, "{message}");
        self.message(Level::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(job_id = %self.job_id, "{message}");
        self.message(Level::Warning, message);
    }

    /// Record an error; the execution's status becomes ERROR.
    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        error!(job_id = %self.job_id, "{message}");
        self.message(Level::Error, message);
    }

    /// Record that there was nothing to do.
    pub fn skipped(&self) {
        self.report("mark_skipped", self.service.mark_skipped(self.job_id));
    }

    /// Record a restart; clears a previous ERROR status.
    pub fn restarted(&self) {
        self.report("mark_restarted", self.service.mark_restarted(self.job_id));
    }

    fn message(&self, level: Level, message: String) {
        let message = JobMessage::new(level, message, self.service.now());
        self.report(
            "append_message",
            self.service.append_message(self.job_id, message),
        );
    }

    fn report(&self, operation: &'static str, result: Result<(), RepositoryError>) {
        match result {
            Ok(()) => {}
            Err(RepositoryError::AlreadyStopped(_)) => {
                debug!(job_id = %self.job_id, operation, "job already stopped; dropping late write");
            }
            Err(e) => {
                warn!(job_id = %self.job_id, operation, error = %e, "failed to record job event");
            }
        }
    }
}
