//! Execution of one job run: heartbeat, restarts, error capture, finalization.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use tracing::{Span, debug, error, info, info_span, warn};

use jobguard_core::{JobId, JobMessage};

use crate::error::RepositoryError;
use crate::publisher::JobEventPublisher;
use crate::runnable::{JobOutcome, JobRunnable};
use crate::service::JobService;

/// Message recorded when a prepared run is dropped before it executed.
pub const NOT_EXECUTED_MESSAGE: &str = "Job was not executed: the executor shut down first";

/// Periodic `keep_alive` for one execution.
#[derive(Debug)]
struct Heartbeat {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl Heartbeat {
    fn spawn(service: JobService, job_id: JobId, interval: Duration, span: Span) -> Option<Self> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let spawned = thread::Builder::new()
            .name(format!("job-heartbeat-{job_id}"))
            .spawn(move || {
                let _entered = span.enter();
                heartbeat_loop(&service, job_id, interval, &shutdown_rx);
            });
        match spawned {
            Ok(join) => Some(Self {
                shutdown: shutdown_tx,
                join: Some(join),
            }),
            Err(e) => {
                error!(job_id = %job_id, error = %e, "failed to spawn heartbeat thread");
                None
            }
        }
    }

    /// Waits for an in-flight tick; a slow store delays this but cannot block it forever
    /// because no further tick is started.
    fn stop(mut self) {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn heartbeat_loop(
    service: &JobService,
    job_id: JobId,
    interval: Duration,
    shutdown_rx: &mpsc::Receiver<()>,
) {
    loop {
        match shutdown_rx.recv_timeout(interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => match service.keep_alive(job_id) {
                Ok(()) => debug!(job_id = %job_id, "heartbeat"),
                Err(RepositoryError::AlreadyStopped(_)) | Err(RepositoryError::NotFound(_)) => {
                    debug!(job_id = %job_id, "job no longer running; heartbeat ends");
                    break;
                }
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Fatal error in ping job");
                }
            },
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// One prepared execution.
///
/// Created right after the run lock was acquired and the record was stored;
/// the heartbeat starts immediately so that a run waiting for a free worker is
/// not mistaken for a dead one. Whatever happens afterwards (normal return,
/// error, panic, or the runner being dropped unexecuted) the heartbeat is
/// cancelled, the record is stopped and the lock is released exactly once.
pub struct JobRunner {
    service: JobService,
    runnable: Arc<dyn JobRunnable>,
    job_id: JobId,
    job_type: String,
    span: Span,
    heartbeat: Option<Heartbeat>,
    executed: bool,
    finished: bool,
}

impl JobRunner {
    pub(crate) fn start(service: JobService, runnable: Arc<dyn JobRunnable>, job_id: JobId) -> Self {
        let job_type = runnable.definition().job_type().to_string();
        let span = info_span!("job", job_type = %job_type, job_id = %job_id);
        let heartbeat = Heartbeat::spawn(
            service.clone(),
            job_id,
            service.heartbeat_interval(),
            span.clone(),
        );
        Self {
            service,
            runnable,
            job_id,
            job_type,
            span,
            heartbeat,
            executed: false,
            finished: false,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    /// Execute the job (with restarts) and finalize the record.
    pub fn run(mut self) {
        let span = self.span.clone();
        let _entered = span.enter();
        info!("Job started '{}'", self.job_id);

        let outcome = self.execute_with_restarts();
        self.executed = true;

        if outcome == Some(JobOutcome::Skipped) {
            JobEventPublisher::new(self.service.clone(), self.job_id, self.job_type.clone())
                .skipped();
        }

        self.finish();
    }

    fn execute_with_restarts(&self) -> Option<JobOutcome> {
        let definition = self.runnable.definition();
        let publisher =
            JobEventPublisher::new(self.service.clone(), self.job_id, self.job_type.clone());
        let mut restarts_left = definition.restarts();

        loop {
            let result =
                panic::catch_unwind(AssertUnwindSafe(|| self.runnable.execute(&publisher)));
            let failure = match result {
                Ok(Ok(outcome)) => return Some(outcome),
                Ok(Err(e)) => format!("{e:#}"),
                Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
            };

            if restarts_left == 0 {
                publisher.error(format!(
                    "Fatal error in job {} ({}): {failure}",
                    self.job_type, self.job_id
                ));
                return None;
            }

            restarts_left -= 1;
            publisher.warn(format!(
                "Restarting job because of an error caught during execution: {failure}"
            ));
            publisher.restarted();
            if let Some(delay) = definition.retry_delay() {
                thread::sleep(delay);
            }
        }
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop();
        }

        let now = self.service.now();
        if !self.executed {
            warn!(job_id = %self.job_id, "job dropped before it was executed");
            let _ = self
                .service
                .append_message(self.job_id, JobMessage::error(NOT_EXECUTED_MESSAGE, now));
        }

        match self.service.repository().stop_job(self.job_id, now, None) {
            Ok(job) => info!(status = %job.status, "Job stopped '{}'", self.job_id),
            Err(RepositoryError::AlreadyStopped(_)) => {
                warn!(job_id = %self.job_id, "job was already stopped, most likely marked dead");
            }
            Err(e) => error!(job_id = %self.job_id, error = %e, "failed to stop job"),
        }

        match self
            .service
            .lock_service()
            .release_run_lock_held_by(&self.job_type, self.job_id)
        {
            Ok(true) => debug!(job_type = %self.job_type, "run lock released"),
            Ok(false) => debug!(job_type = %self.job_type, "run lock already released"),
            Err(e) => error!(job_type = %self.job_type, error = %e, "failed to release run lock"),
        }
    }
}

impl Drop for JobRunner {
    fn drop(&mut self) {
        let span = self.span.clone();
        let _entered = span.enter();
        self.finish();
    }
}

impl std::fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRunner")
            .field("job_id", &self.job_id)
            .field("job_type", &self.job_type)
            .field("executed", &self.executed)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
