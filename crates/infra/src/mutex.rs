//! Static mutex groups: job types that must never run at the same time.

use std::collections::BTreeSet;

/// A named set of job types that exclude each other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobMutexGroup {
    name: String,
    job_types: BTreeSet<String>,
}

impl JobMutexGroup {
    pub fn new<I, S>(name: impl Into<String>, job_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            job_types: job_types.into_iter().map(Into::into).collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn job_types(&self) -> &BTreeSet<String> {
        &self.job_types
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.job_types.contains(job_type)
    }
}

/// Resolver over all configured groups.
#[derive(Debug, Clone, Default)]
pub struct JobMutexGroups {
    groups: Vec<JobMutexGroup>,
}

impl JobMutexGroups {
    pub fn new(groups: impl IntoIterator<Item = JobMutexGroup>) -> Self {
        Self {
            groups: groups.into_iter().collect(),
        }
    }

    pub fn groups(&self) -> &[JobMutexGroup] {
        &self.groups
    }

    /// Every job type that must not run together with `job_type`, including
    /// `job_type` itself: the union of all groups that contain it.
    pub fn mutex_job_types_for(&self, job_type: &str) -> BTreeSet<String> {
        let mut result: BTreeSet<String> = self
            .groups
            .iter()
            .filter(|g| g.contains(job_type))
            .flat_map(|g| g.job_types.iter().cloned())
            .collect();
        result.insert(job_type.to_string());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ungrouped_type_only_excludes_itself() {
        let groups = JobMutexGroups::default();
        let types = groups.mutex_job_types_for("Import");
        assert_eq!(types.into_iter().collect::<Vec<_>>(), vec!["Import"]);
    }

    #[test]
    fn union_of_all_containing_groups() {
        let groups = JobMutexGroups::new([
            JobMutexGroup::new("feeds", ["Import", "Export"]),
            JobMutexGroup::new("db", ["Import", "Reindex"]),
            JobMutexGroup::new("other", ["Report"]),
        ]);

        let types = groups.mutex_job_types_for("Import");
        assert_eq!(
            types.into_iter().collect::<Vec<_>>(),
            vec!["Export", "Import", "Reindex"]
        );

        let types = groups.mutex_job_types_for("Export");
        assert_eq!(types.into_iter().collect::<Vec<_>>(), vec!["Export", "Import"]);
    }
}
