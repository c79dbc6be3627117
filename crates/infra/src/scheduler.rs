//! Timer threads: fixed-rate cleanup passes and definition-driven job triggers.

use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use cron::Schedule;
use tracing::{debug, error, info, warn};

use jobguard_core::{JobDefinition, Trigger};

use crate::cleanup::CleanupStrategy;
use crate::service::JobService;

/// Builder for the set of background loops.
#[derive(Default)]
pub struct Scheduler {
    strategies: Vec<Arc<dyn CleanupStrategy>>,
    triggers: Option<JobService>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strategy(self, strategy: impl CleanupStrategy + 'static) -> Self {
        self.with_strategy_arc(Arc::new(strategy))
    }

    pub fn with_strategy_arc(mut self, strategy: Arc<dyn CleanupStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    pub fn with_strategies(
        mut self,
        strategies: impl IntoIterator<Item = Arc<dyn CleanupStrategy>>,
    ) -> Self {
        self.strategies.extend(strategies);
        self
    }

    /// Trigger every registered job whose definition has a fixed delay or a
    /// cron expression.
    pub fn with_job_triggers(mut self, service: JobService) -> Self {
        self.triggers = Some(service);
        self
    }

    /// Spawn all loops. Cleanup passes run immediately and then at their
    /// fixed rate.
    pub fn start(self) -> SchedulerHandle {
        let mut loops = Vec::new();

        for strategy in self.strategies {
            let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
            let join = thread::Builder::new()
                .name(format!("cleanup-{}", strategy.name()))
                .spawn(move || cleanup_loop(strategy.as_ref(), &shutdown_rx))
                .expect("failed to spawn cleanup thread");
            loops.push((shutdown_tx, join));
        }

        if let Some(service) = self.triggers {
            for definition in service.job_definitions() {
                let Some(plan) = TriggerPlan::from_definition(definition) else {
                    continue;
                };
                let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
                let service = service.clone();
                let definition = definition.clone();
                let join = thread::Builder::new()
                    .name(format!("trigger-{}", definition.job_type()))
                    .spawn(move || trigger_loop(&service, &definition, &plan, &shutdown_rx))
                    .expect("failed to spawn trigger thread");
                loops.push((shutdown_tx, join));
            }
        }

        info!(loops = loops.len(), "scheduler started");
        SchedulerHandle { loops }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field(
                "strategies",
                &self.strategies.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .field("job_triggers", &self.triggers.is_some())
            .finish()
    }
}

/// Handle to the running loops.
#[derive(Debug)]
pub struct SchedulerHandle {
    loops: Vec<(mpsc::Sender<()>, thread::JoinHandle<()>)>,
}

impl SchedulerHandle {
    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// Signal every loop and wait for it. A pass in progress completes first.
    pub fn shutdown(self) {
        for (shutdown, _) in &self.loops {
            let _ = shutdown.send(());
        }
        for (_, join) in self.loops {
            let _ = join.join();
        }
        info!("scheduler stopped");
    }
}

/// Waits for `timeout`; false when shutdown was requested.
fn wait(shutdown_rx: &mpsc::Receiver<()>, timeout: Duration) -> bool {
    matches!(
        shutdown_rx.recv_timeout(timeout),
        Err(mpsc::RecvTimeoutError::Timeout)
    )
}

fn cleanup_loop(strategy: &dyn CleanupStrategy, shutdown_rx: &mpsc::Receiver<()>) {
    loop {
        let started = Instant::now();
        match panic::catch_unwind(AssertUnwindSafe(|| strategy.do_cleanup())) {
            Ok(Ok(report)) => debug!(
                strategy = report.strategy,
                affected = report.affected,
                "cleanup finished"
            ),
            Ok(Err(e)) => warn!(
                strategy = strategy.name(),
                error = %e,
                retryable = e.is_retryable(),
                "cleanup failed"
            ),
            Err(_) => error!(strategy = strategy.name(), "cleanup panicked"),
        }

        let next = strategy.interval().saturating_sub(started.elapsed());
        if !wait(shutdown_rx, next) {
            break;
        }
    }
    debug!(strategy = strategy.name(), "cleanup loop exiting");
}

/// When a definition's job is due.
#[derive(Debug, Clone)]
enum TriggerPlan {
    FixedDelay(Duration),
    Cron(Box<Schedule>),
}

impl TriggerPlan {
    fn from_definition(definition: &JobDefinition) -> Option<Self> {
        match definition.trigger() {
            Trigger::Manual => None,
            Trigger::FixedDelay(delay) => Some(Self::FixedDelay(*delay)),
            Trigger::Cron(expression) => match Schedule::from_str(expression) {
                Ok(schedule) => Some(Self::Cron(Box::new(schedule))),
                Err(e) => {
                    error!(
                        job_type = %definition.job_type(),
                        cron = %expression,
                        error = %e,
                        "invalid cron expression, job is not scheduled"
                    );
                    None
                }
            },
        }
    }

    fn next_delay(&self, service: &JobService) -> Option<Duration> {
        match self {
            Self::FixedDelay(delay) => Some(*delay),
            Self::Cron(schedule) => {
                let now = service.now();
                let next = schedule.after(&now).next()?;
                Some((next - now).to_std().unwrap_or(Duration::ZERO))
            }
        }
    }
}

fn trigger_loop(
    service: &JobService,
    definition: &JobDefinition,
    plan: &TriggerPlan,
    shutdown_rx: &mpsc::Receiver<()>,
) {
    while let Some(delay) = plan.next_delay(service) {
        if !wait(shutdown_rx, delay) {
            break;
        }
        if !trigger(service, definition, shutdown_rx) {
            break;
        }
    }
    debug!(job_type = %definition.job_type(), "trigger loop exiting");
}

/// Start one execution, retrying a blocked start `definition.retries()`
/// times. Returns false when shutdown was requested while waiting.
fn trigger(
    service: &JobService,
    definition: &JobDefinition,
    shutdown_rx: &mpsc::Receiver<()>,
) -> bool {
    let job_type = definition.job_type();
    let mut retries_left = definition.retries();
    loop {
        match service.start_async_job(job_type) {
            Ok(job_id) => {
                debug!(job_type = %job_type, job_id = %job_id, "job triggered");
                return true;
            }
            Err(e) if e.is_blocked() && retries_left > 0 => {
                retries_left -= 1;
                info!(job_type = %job_type, reason = %e, retries_left, "job blocked, retrying");
                let delay = definition.retry_delay().unwrap_or(Duration::from_secs(1));
                if !wait(shutdown_rx, delay) {
                    return false;
                }
            }
            Err(e) if e.is_blocked() => {
                info!(job_type = %job_type, reason = %e, "job blocked, trigger skipped");
                return true;
            }
            Err(e) => {
                warn!(job_type = %job_type, error = %e, "failed to trigger job");
                return true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::CleanupReport;
    use crate::error::RepositoryError;
    use crate::meta::InMemoryJobMetaRepository;
    use crate::repository::InMemoryJobRepository;
    use crate::runnable::{JobFn, JobOutcome};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        runs: Arc<AtomicUsize>,
        fail: bool,
    }

    impl CleanupStrategy for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(10)
        }

        fn do_cleanup(&self) -> Result<CleanupReport, RepositoryError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(RepositoryError::unavailable("store down"))
            } else {
                Ok(CleanupReport::new("counting", 0))
            }
        }
    }

    fn wait_until(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn failing_strategy_does_not_stop_others() {
        let ok_runs = Arc::new(AtomicUsize::new(0));
        let failing_runs = Arc::new(AtomicUsize::new(0));
        let handle = Scheduler::new()
            .with_strategy(Counting {
                runs: failing_runs.clone(),
                fail: true,
            })
            .with_strategy(Counting {
                runs: ok_runs.clone(),
                fail: false,
            })
            .start();

        assert_eq!(handle.len(), 2);
        assert!(wait_until(|| ok_runs.load(Ordering::SeqCst) >= 3));
        assert!(wait_until(|| failing_runs.load(Ordering::SeqCst) >= 3));
        handle.shutdown();
    }

    #[test]
    fn fixed_delay_definition_is_triggered() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let service = JobService::builder(
            InMemoryJobRepository::arc(),
            InMemoryJobMetaRepository::arc(),
        )
        .with_thread_count(1)
        .register(JobFn::new(
            JobDefinition::builder("Import")
                .fixed_delay(Duration::from_millis(10))
                .build()
                .unwrap(),
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(JobOutcome::Executed)
            },
        ))
        .register(JobFn::new(
            JobDefinition::builder("Manual").build().unwrap(),
            |_| Ok(JobOutcome::Executed),
        ))
        .register(JobFn::new(
            JobDefinition::builder("Broken")
                .cron("not a cron expression")
                .build()
                .unwrap(),
            |_| Ok(JobOutcome::Executed),
        ))
        .build()
        .unwrap();

        let handle = Scheduler::new().with_job_triggers(service.clone()).start();
        assert_eq!(handle.len(), 1);
        assert!(wait_until(|| runs.load(Ordering::SeqCst) >= 2));
        handle.shutdown();
        service.shutdown();

        assert!(service.repository().count().unwrap() >= 2);
    }

    #[test]
    fn cron_plan_computes_next_delay() {
        let service = JobService::builder(
            InMemoryJobRepository::arc(),
            InMemoryJobMetaRepository::arc(),
        )
        .with_thread_count(1)
        .build()
        .unwrap();
        let definition = JobDefinition::builder("Nightly")
            .cron("0 0 3 * * *")
            .build()
            .unwrap();

        let plan = TriggerPlan::from_definition(&definition).unwrap();
        let delay = plan.next_delay(&service).unwrap();
        assert!(delay <= Duration::from_secs(24 * 60 * 60));
    }
}
