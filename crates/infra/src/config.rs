//! Runtime configuration for job execution and cleanup.
//!
//! Every value has a default; `from_env` overrides them from `JOBGUARD_*`
//! variables. Unparsable values fall back to the default with a warning.

use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use jobguard_core::{DomainError, DomainResult};

/// 3/4 of a 16 MiB document.
pub const DEFAULT_MAX_LOG_BYTES: usize = 12 * 1024 * 1024;

/// Backing store selection. The sweeper binary only runs against `Postgres`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
    Postgres,
    Redis,
}

impl FromStr for StoreKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreKind::Memory),
            "postgres" => Ok(StoreKind::Postgres),
            "redis" => Ok(StoreKind::Redis),
            other => Err(DomainError::validation(format!(
                "unknown store '{other}' (expected memory, postgres or redis)"
            ))),
        }
    }
}

/// Cleanup strategy settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub number_of_jobs_to_keep: usize,
    pub number_of_skipped_jobs_to_keep: usize,
    pub mark_dead_after: Duration,
    pub max_log_bytes: usize,
    pub keep_log_messages: usize,
    pub keep_last_interval: Duration,
    pub delete_skipped_interval: Duration,
    pub stop_dead_interval: Duration,
    pub too_big_logs_interval: Duration,
    pub clear_locks_interval: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            number_of_jobs_to_keep: 100,
            number_of_skipped_jobs_to_keep: 10,
            mark_dead_after: Duration::from_secs(30),
            max_log_bytes: DEFAULT_MAX_LOG_BYTES,
            keep_log_messages: 1000,
            keep_last_interval: Duration::from_secs(10 * 60),
            delete_skipped_interval: Duration::from_secs(10 * 60),
            stop_dead_interval: Duration::from_secs(60),
            too_big_logs_interval: Duration::from_secs(10 * 60),
            clear_locks_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Job subsystem configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Maximum number of concurrently executing jobs.
    pub thread_count: usize,
    pub heartbeat_interval: Duration,
    pub cleanup: CleanupConfig,
    /// Whether the scheduler triggers jobs from their definitions.
    pub local_scheduling: bool,
    pub store: StoreKind,
    pub database_url: Option<String>,
    pub redis_url: String,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            thread_count: 10,
            heartbeat_interval: Duration::from_secs(20),
            cleanup: CleanupConfig::default(),
            local_scheduling: false,
            store: StoreKind::Memory,
            database_url: None,
            redis_url: "redis://localhost:6379".to_string(),
        }
    }
}

impl JobsConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by `lookup` (an environment-like source).
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let d = Self::default();

        config.thread_count = parse_or("JOBGUARD_THREAD_COUNT", &lookup, d.thread_count);
        config.heartbeat_interval = Duration::from_secs(parse_or(
            "JOBGUARD_HEARTBEAT_SECS",
            &lookup,
            d.heartbeat_interval.as_secs(),
        ));
        config.cleanup.number_of_jobs_to_keep = parse_or(
            "JOBGUARD_KEEP_LAST_JOBS",
            &lookup,
            d.cleanup.number_of_jobs_to_keep,
        );
        config.cleanup.number_of_skipped_jobs_to_keep = parse_or(
            "JOBGUARD_KEEP_SKIPPED_JOBS",
            &lookup,
            d.cleanup.number_of_skipped_jobs_to_keep,
        );
        config.cleanup.mark_dead_after = Duration::from_secs(parse_or(
            "JOBGUARD_MARK_DEAD_AFTER_SECS",
            &lookup,
            d.cleanup.mark_dead_after.as_secs(),
        ));
        config.cleanup.max_log_bytes =
            parse_or("JOBGUARD_MAX_LOG_BYTES", &lookup, d.cleanup.max_log_bytes);
        config.cleanup.keep_log_messages = parse_or(
            "JOBGUARD_KEEP_LOG_MESSAGES",
            &lookup,
            d.cleanup.keep_log_messages,
        );
        config.local_scheduling =
            parse_or("JOBGUARD_LOCAL_SCHEDULING", &lookup, d.local_scheduling);
        config.store = parse_or("JOBGUARD_STORE", &lookup, d.store);
        config.database_url = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty());
        if let Some(url) = lookup("REDIS_URL").filter(|v| !v.trim().is_empty()) {
            config.redis_url = url;
        }

        config
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.thread_count == 0 {
            return Err(DomainError::validation("thread_count must be greater than zero"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(DomainError::validation(
                "heartbeat_interval must be greater than zero",
            ));
        }
        let c = &self.cleanup;
        if c.number_of_jobs_to_keep == 0 || c.keep_log_messages == 0 || c.max_log_bytes == 0 {
            return Err(DomainError::validation(
                "cleanup keep counts and log size limit must be greater than zero",
            ));
        }
        if c.mark_dead_after.is_zero() {
            return Err(DomainError::validation(
                "mark_dead_after must be greater than zero",
            ));
        }
        if c.mark_dead_after <= self.heartbeat_interval {
            warn!(
                mark_dead_after_secs = c.mark_dead_after.as_secs(),
                heartbeat_secs = self.heartbeat_interval.as_secs(),
                "jobs are marked dead before their next heartbeat is due"
            );
        }
        let intervals = [
            c.keep_last_interval,
            c.delete_skipped_interval,
            c.stop_dead_interval,
            c.too_big_logs_interval,
            c.clear_locks_interval,
        ];
        if intervals.iter().any(Duration::is_zero) {
            return Err(DomainError::validation(
                "cleanup intervals must be greater than zero",
            ));
        }
        if self.store == StoreKind::Postgres && self.database_url.is_none() {
            return Err(DomainError::validation(
                "DATABASE_URL is required for the postgres store",
            ));
        }
        Ok(())
    }
}

fn parse_or<T, F>(key: &str, lookup: &F, default: T) -> T
where
    T: FromStr + std::fmt::Debug,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, default = ?default, "invalid value, using default");
                default
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = JobsConfig::default();
        assert_eq!(config.thread_count, 10);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(20));
        assert_eq!(config.cleanup.mark_dead_after, Duration::from_secs(30));
        assert_eq!(config.cleanup.keep_log_messages, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn reads_overrides() {
        let config = JobsConfig::from_lookup(lookup(&[
            ("JOBGUARD_THREAD_COUNT", "4"),
            ("JOBGUARD_MARK_DEAD_AFTER_SECS", "120"),
            ("JOBGUARD_LOCAL_SCHEDULING", "true"),
            ("JOBGUARD_STORE", "Redis"),
            ("REDIS_URL", "redis://cache:6379"),
        ]));

        assert_eq!(config.thread_count, 4);
        assert_eq!(config.cleanup.mark_dead_after, Duration::from_secs(120));
        assert!(config.local_scheduling);
        assert_eq!(config.store, StoreKind::Redis);
        assert_eq!(config.redis_url, "redis://cache:6379");
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let config = JobsConfig::from_lookup(lookup(&[
            ("JOBGUARD_THREAD_COUNT", "many"),
            ("JOBGUARD_STORE", "mongo"),
        ]));
        assert_eq!(config.thread_count, 10);
        assert_eq!(config.store, StoreKind::Memory);
    }

    #[test]
    fn validate_rejects_zero_and_missing_database() {
        let config = JobsConfig::from_lookup(lookup(&[("JOBGUARD_THREAD_COUNT", "0")]));
        assert!(config.validate().is_err());

        let config = JobsConfig::from_lookup(lookup(&[("JOBGUARD_STORE", "postgres")]));
        assert!(config.validate().is_err());
    }
}
