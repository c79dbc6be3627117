//! Captures log events emitted inside a job execution into that job's message history.

use std::cell::Cell;
use std::fmt::{self, Write as _};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber, span};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

use jobguard_core::{JobId, JobMessage, Level};

/// Name of the span every execution runs in.
pub const JOB_SPAN_NAME: &str = "job";

/// Targets whose events never become job messages: the job machinery writes
/// its own messages directly.
pub const DEFAULT_IGNORED_TARGETS: [&str; 2] = ["jobguard_infra", "jobguard_core"];

/// Receiver of captured job messages.
pub trait JobMessageSink: Send + Sync {
    /// Failures are swallowed; logging must not fail a job.
    fn append(&self, job_id: JobId, message: JobMessage);

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

impl<K: JobMessageSink + ?Sized> JobMessageSink for Arc<K> {
    fn append(&self, job_id: JobId, message: JobMessage) {
        (**self).append(job_id, message)
    }

    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}

thread_local! {
    static APPENDING: Cell<bool> = const { Cell::new(false) };
}

/// Resets the re-entrancy flag, also when the sink panics.
struct AppendGuard;

impl AppendGuard {
    fn enter() -> Option<Self> {
        if APPENDING.with(|a| a.replace(true)) {
            None
        } else {
            Some(AppendGuard)
        }
    }
}

impl Drop for AppendGuard {
    fn drop(&mut self) {
        APPENDING.with(|a| a.set(false));
    }
}

/// Job id attached to a `job` span.
struct JobSpan(JobId);

/// `tracing_subscriber` layer that turns INFO, WARN and ERROR events inside a
/// `job` span into job messages. WARN maps to WARNING; DEBUG and TRACE are
/// not captured. Events raised while a message is being appended are dropped.
pub struct JobLogLayer<K> {
    sink: K,
    ignored_targets: Vec<String>,
}

impl<K: JobMessageSink> JobLogLayer<K> {
    pub fn new(sink: K) -> Self {
        Self {
            sink,
            ignored_targets: DEFAULT_IGNORED_TARGETS.iter().map(|t| t.to_string()).collect(),
        }
    }

    pub fn with_ignored_target(mut self, prefix: impl Into<String>) -> Self {
        self.ignored_targets.push(prefix.into());
        self
    }

    fn is_ignored(&self, target: &str) -> bool {
        self.ignored_targets
            .iter()
            .any(|prefix| target.starts_with(prefix.as_str()))
    }
}

impl<S, K> Layer<S> for JobLogLayer<K>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    K: JobMessageSink + 'static,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        if attrs.metadata().name() != JOB_SPAN_NAME {
            return;
        }
        let mut visitor = JobIdVisitor::default();
        attrs.record(&mut visitor);
        let Some(job_id) = visitor.0.and_then(|raw| raw.parse::<JobId>().ok()) else {
            return;
        };
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(JobSpan(job_id));
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let level = match *metadata.level() {
            tracing::Level::ERROR => Level::Error,
            tracing::Level::WARN => Level::Warning,
            tracing::Level::INFO => Level::Info,
            _ => return,
        };
        if self.is_ignored(metadata.target()) {
            return;
        }
        let job_id = ctx
            .event_scope(event)
            .into_iter()
            .flatten()
            .find_map(|span| span.extensions().get::<JobSpan>().map(|j| j.0));
        let Some(job_id) = job_id else {
            return;
        };
        let Some(_guard) = AppendGuard::enter() else {
            return;
        };

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.sink
            .append(job_id, JobMessage::new(level, visitor.finish(), self.sink.now()));
    }
}

impl<K> fmt::Debug for JobLogLayer<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobLogLayer")
            .field("ignored_targets", &self.ignored_targets)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct JobIdVisitor(Option<String>);

impl Visit for JobIdVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "job_id" {
            self.0 = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "job_id" {
            self.0 = Some(format!("{value:?}"));
        }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.trim_start().to_string()
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tracing_subscriber::layer::SubscriberExt;

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<(JobId, JobMessage)>>);

    impl JobMessageSink for RecordingSink {
        fn append(&self, job_id: JobId, message: JobMessage) {
            self.0.lock().unwrap().push((job_id, message));
        }
    }

    #[test]
    fn captures_events_inside_job_span() {
        let sink = Arc::new(RecordingSink::default());
        let subscriber = tracing_subscriber::registry().with(JobLogLayer::new(sink.clone()));
        let job_id = JobId::new();

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "import_feed", "outside of any job");
            let span = tracing::info_span!("job", job_type = "ImportFeed", job_id = %job_id);
            let _entered = span.enter();
            tracing::info!(target: "import_feed", rows = 3, "imported");
            tracing::warn!(target: "import_feed", "slow source");
            tracing::error!(target: "import_feed", "source failed");
            tracing::debug!(target: "import_feed", "not captured");
            tracing::info!(target: "jobguard_infra::runner", "internal");
        });

        let captured = sink.0.lock().unwrap();
        let levels: Vec<_> = captured.iter().map(|(_, m)| m.level).collect();
        assert_eq!(levels, vec![Level::Info, Level::Warning, Level::Error]);
        assert!(captured.iter().all(|(id, _)| *id == job_id));
        assert_eq!(captured[0].1.message, "imported rows=3");
        assert_eq!(captured[1].1.message, "slow source");
    }

    #[test]
    fn nested_spans_inherit_the_job() {
        let sink = Arc::new(RecordingSink::default());
        let subscriber = tracing_subscriber::registry().with(JobLogLayer::new(sink.clone()));
        let job_id = JobId::new();

        tracing::subscriber::with_default(subscriber, || {
            let job = tracing::info_span!("job", job_id = %job_id);
            let _job = job.enter();
            let step = tracing::info_span!("download");
            let _step = step.enter();
            tracing::info!(target: "import_feed", "page 1");
        });

        let captured = sink.0.lock().unwrap();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].0, job_id);
    }

    struct LoggingSink(Arc<RecordingSink>);

    impl JobMessageSink for LoggingSink {
        fn append(&self, job_id: JobId, message: JobMessage) {
            tracing::error!(target: "import_feed", "sink is logging");
            self.0.append(job_id, message);
        }
    }

    #[test]
    fn events_raised_while_appending_are_dropped() {
        let recorded = Arc::new(RecordingSink::default());
        let subscriber =
            tracing_subscriber::registry().with(JobLogLayer::new(LoggingSink(recorded.clone())));
        let job_id = JobId::new();

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("job", job_id = %job_id);
            let _entered = span.enter();
            tracing::info!(target: "import_feed", "once");
        });

        assert_eq!(recorded.0.lock().unwrap().len(), 1);
    }
}
