//! Read-only view over the registered job definitions.

use std::collections::BTreeMap;

use jobguard_core::JobDefinition;

/// Definitions keyed by lower-cased job type.
#[derive(Debug, Clone, Default)]
pub struct JobDefinitionService {
    definitions: BTreeMap<String, JobDefinition>,
}

impl JobDefinitionService {
    pub fn new(definitions: impl IntoIterator<Item = JobDefinition>) -> Self {
        Self {
            definitions: definitions
                .into_iter()
                .map(|d| (d.job_type().to_lowercase(), d))
                .collect(),
        }
    }

    /// All definitions, ordered by job type.
    pub fn job_definitions(&self) -> Vec<&JobDefinition> {
        self.definitions.values().collect()
    }

    /// Case-insensitive lookup.
    pub fn job_definition(&self, job_type: &str) -> Option<&JobDefinition> {
        self.definitions.get(&job_type.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
