//! Typed access to one job type's meta values.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use jobguard_core::DomainError;

use crate::error::RepositoryError;
use crate::meta::JobMetaRepository;

/// Meta values of a single job type.
///
/// Instants are stored as epoch milliseconds. Passing `None` to a setter
/// deletes the key. A stored value that does not parse as the requested type
/// is reported as a validation error.
#[derive(Clone)]
pub struct JobMetaHandle {
    meta: Arc<dyn JobMetaRepository>,
    job_type: String,
}

impl JobMetaHandle {
    pub fn new(meta: Arc<dyn JobMetaRepository>, job_type: impl Into<String>) -> Self {
        Self {
            meta,
            job_type: job_type.into(),
        }
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn get_string(&self, key: &str) -> Result<Option<String>, RepositoryError> {
        self.meta.get_value(&self.job_type, key)
    }

    pub fn get_int(&self, key: &str) -> Result<Option<i32>, RepositoryError> {
        self.get_parsed(key)
    }

    pub fn get_long(&self, key: &str) -> Result<Option<i64>, RepositoryError> {
        self.get_parsed(key)
    }

    pub fn get_instant(&self, key: &str) -> Result<Option<DateTime<Utc>>, RepositoryError> {
        match self.get_parsed::<i64>(key)? {
            None => Ok(None),
            Some(millis) => Utc
                .timestamp_millis_opt(millis)
                .single()
                .map(Some)
                .ok_or_else(|| invalid_value(&self.job_type, key, &millis.to_string())),
        }
    }

    /// Returns the previous value.
    pub fn set_string(
        &self,
        key: &str,
        value: Option<&str>,
    ) -> Result<Option<String>, RepositoryError> {
        self.meta.set_value(&self.job_type, key, value)
    }

    pub fn set_int(&self, key: &str, value: Option<i32>) -> Result<(), RepositoryError> {
        self.set_display(key, value)
    }

    pub fn set_long(&self, key: &str, value: Option<i64>) -> Result<(), RepositoryError> {
        self.set_display(key, value)
    }

    pub fn set_instant(
        &self,
        key: &str,
        value: Option<DateTime<Utc>>,
    ) -> Result<(), RepositoryError> {
        self.set_display(key, value.map(|v| v.timestamp_millis()))
    }

    pub fn delete(&self, key: &str) -> Result<(), RepositoryError> {
        self.meta.set_value(&self.job_type, key, None).map(|_| ())
    }

    /// Store `value` only if `key` is absent.
    pub fn create_string(&self, key: &str, value: &str) -> Result<bool, RepositoryError> {
        self.meta.create_value(&self.job_type, key, value)
    }

    pub fn is_disabled(&self) -> Result<bool, RepositoryError> {
        Ok(self.meta.get_job_meta(&self.job_type)?.is_disabled())
    }

    /// Comment given when the type was disabled; empty when enabled.
    pub fn disabled_comment(&self) -> Result<String, RepositoryError> {
        Ok(self
            .meta
            .get_job_meta(&self.job_type)?
            .disabled_comment()
            .to_string())
    }

    fn get_parsed<T: FromStr>(&self, key: &str) -> Result<Option<T>, RepositoryError> {
        match self.get_string(key)? {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| invalid_value(&self.job_type, key, &raw)),
        }
    }

    fn set_display<T: ToString>(&self, key: &str, value: Option<T>) -> Result<(), RepositoryError> {
        let value = value.map(|v| v.to_string());
        self.meta
            .set_value(&self.job_type, key, value.as_deref())
            .map(|_| ())
    }
}

fn invalid_value(job_type: &str, key: &str, raw: &str) -> RepositoryError {
    DomainError::validation(format!(
        "meta value '{key}' of job type '{job_type}' has unexpected format: '{raw}'"
    ))
    .into()
}

impl std::fmt::Debug for JobMetaHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobMetaHandle")
            .field("job_type", &self.job_type)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::InMemoryJobMetaRepository;

    fn handle() -> JobMetaHandle {
        JobMetaHandle::new(InMemoryJobMetaRepository::arc(), "ImportFeed")
    }

    #[test]
    fn typed_values() {
        let meta = handle();
        let at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();

        meta.set_int("pages", Some(42)).unwrap();
        meta.set_long("offset", Some(9_000_000_000)).unwrap();
        meta.set_instant("last_import", Some(at)).unwrap();

        assert_eq!(meta.get_int("pages").unwrap(), Some(42));
        assert_eq!(meta.get_long("offset").unwrap(), Some(9_000_000_000));
        assert_eq!(meta.get_instant("last_import").unwrap(), Some(at));
        assert_eq!(
            meta.get_string("last_import").unwrap().as_deref(),
            Some("1700000000123")
        );
    }

    #[test]
    fn none_deletes() {
        let meta = handle();
        meta.set_int("pages", Some(1)).unwrap();
        meta.set_int("pages", None).unwrap();
        assert_eq!(meta.get_int("pages").unwrap(), None);

        meta.set_string("etag", Some("abc")).unwrap();
        meta.delete("etag").unwrap();
        assert_eq!(meta.get_string("etag").unwrap(), None);
    }

    #[test]
    fn unparsable_value_is_a_validation_error() {
        let meta = handle();
        meta.set_string("pages", Some("many")).unwrap();
        assert!(matches!(
            meta.get_int("pages"),
            Err(RepositoryError::Domain(DomainError::Validation(_)))
        ));
    }

    #[test]
    fn create_string_does_not_overwrite() {
        let meta = handle();
        assert!(meta.create_string("cursor", "v1").unwrap());
        assert!(!meta.create_string("cursor", "v2").unwrap());
        assert_eq!(meta.get_string("cursor").unwrap().as_deref(), Some("v1"));
    }

    #[test]
    fn reserved_keys_are_rejected() {
        let meta = handle();
        assert!(meta.set_string("_e_running", Some("x")).is_err());
        assert!(!meta.is_disabled().unwrap());
        assert_eq!(meta.disabled_comment().unwrap(), "");
    }
}
