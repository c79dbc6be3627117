//! Job execution records and their lifecycle.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;

/// Message appended when a job is force-stopped by the dead-job sweep.
pub const DEAD_MESSAGE: &str = "Job didn't receive updates for a while, considering it dead";

/// Message appended when a job reports that it had nothing to do.
pub const SKIPPED_MESSAGE: &str = "Skipped job ..";

/// Message appended when the runner restarts a failed execution.
pub const RESTART_MESSAGE: &str = "Restarting job ..";

/// Message appended when an oversized message log is truncated.
pub const TRUNCATED_MESSAGE: &str =
    "The message log of this job grew too large, dropped all but the most recent messages.";

/// Fixed per-message storage overhead used by [`JobInfo::estimated_log_size`].
pub const MESSAGE_OVERHEAD_BYTES: usize = 64;

/// Outcome status of a job execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Initial status; job is healthy.
    Ok,
    /// At least one error was reported (sticky until an explicit restart).
    Error,
    /// Force-stopped by the dead-job sweep after missing heartbeats.
    Dead,
    /// The job determined there was no work to do.
    Skipped,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Ok => "OK",
            JobStatus::Error => "ERROR",
            JobStatus::Dead => "DEAD",
            JobStatus::Skipped => "SKIPPED",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OK" => Ok(JobStatus::Ok),
            "ERROR" => Ok(JobStatus::Error),
            "DEAD" => Ok(JobStatus::Dead),
            "SKIPPED" => Ok(JobStatus::Skipped),
            other => Err(DomainError::validation(format!("unknown job status '{other}'"))),
        }
    }
}

/// Severity of a job message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Level {
    Info,
    Warning,
    Error,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
        }
    }
}

impl core::fmt::Display for Level {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INFO" => Ok(Level::Info),
            "WARNING" => Ok(Level::Warning),
            "ERROR" => Ok(Level::Error),
            other => Err(DomainError::validation(format!("unknown message level '{other}'"))),
        }
    }
}

/// A single entry of a job's message history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    pub level: Level,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl JobMessage {
    pub fn new(level: Level, message: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            level,
            message: message.into(),
            timestamp,
        }
    }

    pub fn info(message: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self::new(Level::Info, message, timestamp)
    }

    pub fn warning(message: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self::new(Level::Warning, message, timestamp)
    }

    pub fn error(message: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self::new(Level::Error, message, timestamp)
    }
}

/// One record per job execution.
///
/// The presence of `stopped` is the only "still running" signal. Once it is set
/// the record is history: every mutator returns [`DomainError::AlreadyStopped`]
/// and leaves the record untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub job_id: JobId,
    pub job_type: String,
    pub started: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub stopped: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub messages: Vec<JobMessage>,
    pub hostname: String,
}

impl JobInfo {
    /// Create the record for a freshly started execution.
    pub fn new(
        job_id: JobId,
        job_type: impl Into<String>,
        started: DateTime<Utc>,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            job_id,
            job_type: job_type.into(),
            started,
            last_updated: started,
            stopped: None,
            status: JobStatus::Ok,
            messages: Vec::new(),
            hostname: hostname.into(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_some()
    }

    pub fn ensure_running(&self) -> DomainResult<()> {
        if self.is_stopped() {
            Err(DomainError::AlreadyStopped(self.job_id))
        } else {
            Ok(())
        }
    }

    /// Append a message; an error-level message flips the status to ERROR.
    pub fn append_message(&mut self, message: JobMessage) -> DomainResult<()> {
        self.ensure_running()?;
        if message.level == Level::Error {
            self.status = JobStatus::Error;
        }
        self.touch(message.timestamp);
        self.messages.push(message);
        Ok(())
    }

    /// Heartbeat: bump `last_updated` only.
    pub fn ping(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_running()?;
        self.touch(at);
        Ok(())
    }

    /// Change the status of a running job.
    ///
    /// DEAD is reserved for [`JobInfo::stop`] and ERROR only reverts through
    /// [`JobInfo::mark_restarted`].
    pub fn set_status(&mut self, status: JobStatus) -> DomainResult<()> {
        self.ensure_running()?;
        match (self.status, status) {
            (_, JobStatus::Dead) => Err(DomainError::invariant(
                "DEAD can only be set when stopping a job",
            )),
            (JobStatus::Error, JobStatus::Ok | JobStatus::Skipped) => Err(DomainError::conflict(
                format!("job {} is in ERROR and was not restarted", self.job_id),
            )),
            _ => {
                self.status = status;
                Ok(())
            }
        }
    }

    /// The job reported that there was no work to do.
    pub fn mark_skipped(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        self.append_message(JobMessage::info(SKIPPED_MESSAGE, at))?;
        if self.status != JobStatus::Error {
            self.status = JobStatus::Skipped;
        }
        Ok(())
    }

    /// Explicit restart signal: the only way back from ERROR to OK.
    pub fn mark_restarted(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        self.append_message(JobMessage::warning(RESTART_MESSAGE, at))?;
        self.status = JobStatus::Ok;
        Ok(())
    }

    /// Finalize the record.
    ///
    /// `stopped` is clamped so that it is never before `started` nor before the
    /// last recorded update.
    pub fn stop(&mut self, at: DateTime<Utc>, status: Option<JobStatus>) -> DomainResult<()> {
        self.ensure_running()?;
        let stopped = at.max(self.started).max(self.last_updated);
        self.stopped = Some(stopped);
        self.last_updated = stopped;
        if let Some(status) = status {
            self.status = status;
        }
        Ok(())
    }

    /// Keep the newest `keep_last - 1` messages and append `note`.
    pub fn truncate_messages(&mut self, keep_last: usize, note: JobMessage) -> DomainResult<()> {
        self.ensure_running()?;
        let keep = keep_last.saturating_sub(1);
        let excess = self.messages.len().saturating_sub(keep);
        self.messages.drain(..excess);
        if keep_last > 0 {
            self.touch(note.timestamp);
            self.messages.push(note);
        }
        Ok(())
    }

    /// Rough persisted size of the message log in bytes.
    pub fn estimated_log_size(&self) -> usize {
        self.messages
            .iter()
            .map(|m| m.message.len() + MESSAGE_OVERHEAD_BYTES)
            .sum()
    }

    /// A copy without message history, for bulk scans.
    pub fn without_messages(&self) -> Self {
        Self {
            messages: Vec::new(),
            ..self.clone()
        }
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.last_updated {
            self.last_updated = at;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn running_job() -> JobInfo {
        JobInfo::new(JobId::new(), "ImportFeed", Utc::now(), "host-1")
    }

    #[test]
    fn new_job_is_running_and_ok() {
        let job = running_job();
        assert!(!job.is_stopped());
        assert_eq!(job.status, JobStatus::Ok);
        assert_eq!(job.last_updated, job.started);
    }

    #[test]
    fn error_message_flips_status() {
        let mut job = running_job();
        job.append_message(JobMessage::info("working", Utc::now()))
            .unwrap();
        assert_eq!(job.status, JobStatus::Ok);

        job.append_message(JobMessage::error("boom", Utc::now()))
            .unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.messages.len(), 2);
    }

    #[test]
    fn error_is_sticky_until_restart() {
        let mut job = running_job();
        job.append_message(JobMessage::error("boom", Utc::now()))
            .unwrap();

        assert!(matches!(
            job.set_status(JobStatus::Ok),
            Err(DomainError::Conflict(_))
        ));

        job.mark_skipped(Utc::now()).unwrap();
        assert_eq!(job.status, JobStatus::Error);

        job.mark_restarted(Utc::now()).unwrap();
        assert_eq!(job.status, JobStatus::Ok);
    }

    #[test]
    fn dead_is_only_reachable_through_stop() {
        let mut job = running_job();
        assert!(matches!(
            job.set_status(JobStatus::Dead),
            Err(DomainError::InvariantViolation(_))
        ));

        job.stop(Utc::now(), Some(JobStatus::Dead)).unwrap();
        assert_eq!(job.status, JobStatus::Dead);
    }

    #[test]
    fn stopped_job_rejects_every_mutation() {
        let mut job = running_job();
        job.stop(Utc::now(), None).unwrap();
        let snapshot = job.clone();

        let later = Utc::now() + Duration::seconds(10);
        assert!(matches!(
            job.append_message(JobMessage::info("late", later)),
            Err(DomainError::AlreadyStopped(_))
        ));
        assert!(job.ping(later).is_err());
        assert!(job.set_status(JobStatus::Skipped).is_err());
        assert!(job.mark_skipped(later).is_err());
        assert!(job.mark_restarted(later).is_err());
        assert!(job.stop(later, Some(JobStatus::Dead)).is_err());
        assert!(
            job.truncate_messages(1, JobMessage::info("note", later))
                .is_err()
        );

        assert_eq!(job, snapshot);
    }

    #[test]
    fn stop_is_never_before_started_or_last_update() {
        let mut job = running_job();
        let ahead = job.started + Duration::seconds(30);
        job.ping(ahead).unwrap();

        job.stop(job.started - Duration::seconds(5), None).unwrap();

        assert_eq!(job.stopped, Some(ahead));
        assert_eq!(job.last_updated, ahead);
    }

    #[test]
    fn ping_never_moves_last_updated_backwards() {
        let mut job = running_job();
        let ahead = job.started + Duration::seconds(30);
        job.ping(ahead).unwrap();
        job.ping(job.started).unwrap();
        assert_eq!(job.last_updated, ahead);
    }

    #[test]
    fn truncate_keeps_newest_messages_plus_note() {
        let mut job = running_job();
        for i in 0..10 {
            job.append_message(JobMessage::info(format!("m{i}"), Utc::now()))
                .unwrap();
        }

        job.truncate_messages(4, JobMessage::info(TRUNCATED_MESSAGE, Utc::now()))
            .unwrap();

        let texts: Vec<_> = job.messages.iter().map(|m| m.message.as_str()).collect();
        assert_eq!(texts, vec!["m7", "m8", "m9", TRUNCATED_MESSAGE]);
    }

    #[test]
    fn status_and_level_round_trip_as_strings() {
        for status in [
            JobStatus::Ok,
            JobStatus::Error,
            JobStatus::Dead,
            JobStatus::Skipped,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("WARN".parse::<Level>().is_err());
    }
}
