//! The job business-logic contract.

use jobguard_core::JobDefinition;

use crate::publisher::JobEventPublisher;

/// Result of one successful execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The job did its work.
    Executed,
    /// The job found nothing to do; the record ends up SKIPPED unless it is in ERROR.
    Skipped,
}

/// A job type implementation.
///
/// `execute` is invoked exactly once per started execution (plus once per
/// restart when the definition allows restarts). Returning `Err` or panicking
/// ends the execution in ERROR; neither reaches the caller that triggered it.
pub trait JobRunnable: Send + Sync {
    fn definition(&self) -> &JobDefinition;

    fn execute(&self, events: &JobEventPublisher) -> anyhow::Result<JobOutcome>;
}

/// Closure-backed [`JobRunnable`].
pub struct JobFn<F> {
    definition: JobDefinition,
    f: F,
}

impl<F> JobFn<F>
where
    F: Fn(&JobEventPublisher) -> anyhow::Result<JobOutcome> + Send + Sync,
{
    pub fn new(definition: JobDefinition, f: F) -> Self {
        Self { definition, f }
    }
}

impl<F> JobRunnable for JobFn<F>
where
    F: Fn(&JobEventPublisher) -> anyhow::Result<JobOutcome> + Send + Sync,
{
    fn definition(&self) -> &JobDefinition {
        &self.definition
    }

    fn execute(&self, events: &JobEventPublisher) -> anyhow::Result<JobOutcome> {
        (self.f)(events)
    }
}

impl<F> std::fmt::Debug for JobFn<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobFn")
            .field("job_type", &self.definition.job_type())
            .finish_non_exhaustive()
    }
}
