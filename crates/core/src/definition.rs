//! Static, code-configured job descriptors.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// How a job type expects to be triggered.
///
/// Fixed delay and cron are mutually exclusive by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Only started by an explicit call (e.g. an operator).
    Manual,
    /// Started again after this delay.
    FixedDelay(Duration),
    /// Started whenever the cron expression fires.
    Cron(String),
}

/// Definition of when and how a job type runs.
///
/// Immutable; built once at startup with [`JobDefinition::builder`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefinition {
    job_type: String,
    job_name: String,
    description: String,
    trigger: Trigger,
    restarts: u32,
    retries: u32,
    retry_delay: Option<Duration>,
    max_age: Option<Duration>,
}

impl JobDefinition {
    pub fn builder(job_type: impl Into<String>) -> JobDefinitionBuilder {
        JobDefinitionBuilder::new(job_type)
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    pub fn fixed_delay(&self) -> Option<Duration> {
        match self.trigger {
            Trigger::FixedDelay(d) => Some(d),
            _ => None,
        }
    }

    pub fn cron(&self) -> Option<&str> {
        match &self.trigger {
            Trigger::Cron(expr) => Some(expr),
            _ => None,
        }
    }

    /// How often the runner re-executes the job after it failed.
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// How often a trigger retries a start that was blocked.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn retry_delay(&self) -> Option<Duration> {
        self.retry_delay
    }

    /// Age after which the last execution is reported as too old (informational).
    pub fn max_age(&self) -> Option<Duration> {
        self.max_age
    }
}

/// Builder for [`JobDefinition`].
#[derive(Debug, Clone)]
pub struct JobDefinitionBuilder {
    job_type: String,
    job_name: Option<String>,
    description: String,
    trigger: Trigger,
    restarts: u32,
    retries: u32,
    retry_delay: Option<Duration>,
    max_age: Option<Duration>,
}

impl JobDefinitionBuilder {
    fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            job_name: None,
            description: String::new(),
            trigger: Trigger::Manual,
            restarts: 0,
            retries: 0,
            retry_delay: None,
            max_age: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.job_name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn fixed_delay(mut self, delay: Duration) -> Self {
        self.trigger = Trigger::FixedDelay(delay);
        self
    }

    pub fn cron(mut self, expression: impl Into<String>) -> Self {
        self.trigger = Trigger::Cron(expression.into());
        self
    }

    pub fn restarts(mut self, restarts: u32) -> Self {
        self.restarts = restarts;
        self
    }

    pub fn retries(mut self, retries: u32, delay: Duration) -> Self {
        self.retries = retries;
        self.retry_delay = Some(delay);
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn build(self) -> DomainResult<JobDefinition> {
        let job_type = self.job_type.trim().to_string();
        if job_type.is_empty() {
            return Err(DomainError::validation("job type must not be empty"));
        }
        if let Trigger::FixedDelay(d) = self.trigger {
            if d.is_zero() {
                return Err(DomainError::validation(format!(
                    "fixed delay of job type '{job_type}' must be greater than zero"
                )));
            }
        }
        if let Trigger::Cron(expr) = &self.trigger {
            if expr.trim().is_empty() {
                return Err(DomainError::validation(format!(
                    "cron expression of job type '{job_type}' must not be empty"
                )));
            }
        }

        let job_name = self.job_name.unwrap_or_else(|| job_type.clone());

        Ok(JobDefinition {
            job_type,
            job_name,
            description: self.description,
            trigger: self.trigger,
            restarts: self.restarts,
            retries: self.retries,
            retry_delay: self.retry_delay,
            max_age: self.max_age,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_fixed_delay_definition() {
        let def = JobDefinition::builder("ImportFeed")
            .name("Import Feed")
            .description("Imports the product feed")
            .fixed_delay(Duration::from_secs(60))
            .restarts(2)
            .retries(3, Duration::from_secs(5))
            .max_age(Duration::from_secs(3600))
            .build()
            .unwrap();

        assert_eq!(def.job_type(), "ImportFeed");
        assert_eq!(def.fixed_delay(), Some(Duration::from_secs(60)));
        assert_eq!(def.cron(), None);
        assert_eq!(def.restarts(), 2);
        assert_eq!(def.retries(), 3);
        assert_eq!(def.retry_delay(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn cron_replaces_fixed_delay() {
        let def = JobDefinition::builder("Nightly")
            .fixed_delay(Duration::from_secs(60))
            .cron("0 0 3 * * *")
            .build()
            .unwrap();

        assert_eq!(def.fixed_delay(), None);
        assert_eq!(def.cron(), Some("0 0 3 * * *"));
        assert_eq!(def.job_name(), "Nightly");
    }

    #[test]
    fn rejects_empty_type_and_zero_delay() {
        assert!(JobDefinition::builder("  ").build().is_err());
        assert!(
            JobDefinition::builder("X")
                .fixed_delay(Duration::ZERO)
                .build()
                .is_err()
        );
    }
}
