//! Redis-backed meta repository.
//!
//! - **Documents**: one hash per job type, `{prefix}:meta:{job_type}`
//! - **Type index**: a set of known job types, `{prefix}:meta:types`
//! - **Run locks**: the `_e_running` field of the type's hash
//!
//! Group acquisition runs as one Lua script, so Redis evaluates the disabled
//! check, every group member's lock and the final write without interleaving.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tracing::instrument;

use jobguard_core::meta::{KEY_DISABLED, KEY_RUNNING, check_meta_key};
use jobguard_core::{BlockReason, JobMeta, RunningJob};

use super::r#trait::JobMetaRepository;
use crate::error::RepositoryError;

/// Default key prefix.
const DEFAULT_PREFIX: &str = "jobguard";

const ACQUIRE_SCRIPT: &str = r#"
local disabled = redis.call('HGET', KEYS[2], ARGV[4])
if disabled then
  return {'disabled', disabled}
end
local running = redis.call('HGET', KEYS[2], ARGV[3])
if running then
  return {'running', running}
end
for i = 3, #KEYS do
  if redis.call('HEXISTS', KEYS[i], ARGV[3]) == 1 then
    return {'mutex', ARGV[i + 2]}
  end
end
redis.call('HSET', KEYS[2], ARGV[3], ARGV[1])
redis.call('SADD', KEYS[1], ARGV[2])
return {'ok'}
"#;

const RELEASE_HELD_BY_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], ARGV[2]) == ARGV[1] then
  redis.call('HDEL', KEYS[1], ARGV[2])
  return 1
end
return 0
"#;

const SET_VALUE_SCRIPT: &str = r#"
local previous = redis.call('HGET', KEYS[2], ARGV[2])
if ARGV[3] == '1' then
  redis.call('HSET', KEYS[2], ARGV[2], ARGV[4])
  redis.call('SADD', KEYS[1], ARGV[1])
else
  redis.call('HDEL', KEYS[2], ARGV[2])
end
return previous
"#;

#[derive(Debug, Clone)]
pub struct RedisJobMetaRepository {
    client: Arc<redis::Client>,
    prefix: String,
    acquire: Arc<redis::Script>,
    release_held_by: Arc<redis::Script>,
    set_value: Arc<redis::Script>,
}

impl RedisJobMetaRepository {
    /// Create a repository for `redis_url` (e.g. "redis://localhost:6379").
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, RepositoryError> {
        Self::with_prefix(redis_url, DEFAULT_PREFIX)
    }

    pub fn with_prefix(
        redis_url: impl AsRef<str>,
        prefix: impl Into<String>,
    ) -> Result<Self, RepositoryError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(map_redis_error)?;
        Ok(Self {
            client: Arc::new(client),
            prefix: prefix.into(),
            acquire: Arc::new(redis::Script::new(ACQUIRE_SCRIPT)),
            release_held_by: Arc::new(redis::Script::new(RELEASE_HELD_BY_SCRIPT)),
            set_value: Arc::new(redis::Script::new(SET_VALUE_SCRIPT)),
        })
    }

    fn connection(&self) -> Result<redis::Connection, RepositoryError> {
        self.client.get_connection().map_err(map_redis_error)
    }

    fn document_key(&self, job_type: &str) -> String {
        format!("{}:meta:{}", self.prefix, job_type)
    }

    fn types_key(&self) -> String {
        format!("{}:meta:types", self.prefix)
    }

    fn hset(&self, job_type: &str, key: &str, value: &str) -> Result<(), RepositoryError> {
        let mut conn = self.connection()?;
        redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(self.document_key(job_type))
            .arg(key)
            .arg(value)
            .ignore()
            .cmd("SADD")
            .arg(self.types_key())
            .arg(job_type)
            .ignore()
            .query::<()>(&mut conn)
            .map_err(map_redis_error)
    }

    fn hdel(&self, job_type: &str, key: &str) -> Result<(), RepositoryError> {
        let mut conn = self.connection()?;
        redis::cmd("HDEL")
            .arg(self.document_key(job_type))
            .arg(key)
            .query::<i64>(&mut conn)
            .map_err(map_redis_error)?;
        Ok(())
    }
}

impl JobMetaRepository for RedisJobMetaRepository {
    fn get_value(&self, job_type: &str, key: &str) -> Result<Option<String>, RepositoryError> {
        let mut conn = self.connection()?;
        redis::cmd("HGET")
            .arg(self.document_key(job_type))
            .arg(key)
            .query(&mut conn)
            .map_err(map_redis_error)
    }

    fn set_value(
        &self,
        job_type: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<Option<String>, RepositoryError> {
        check_meta_key(key)?;
        let mut conn = self.connection()?;
        let mut invocation = self.set_value.prepare_invoke();
        invocation
            .key(self.types_key())
            .key(self.document_key(job_type))
            .arg(job_type)
            .arg(key)
            .arg(if value.is_some() { "1" } else { "0" })
            .arg(value.unwrap_or(""));
        invocation.invoke(&mut conn).map_err(map_redis_error)
    }

    fn create_value(
        &self,
        job_type: &str,
        key: &str,
        value: &str,
    ) -> Result<bool, RepositoryError> {
        check_meta_key(key)?;
        let mut conn = self.connection()?;
        let (created,): (i64,) = redis::pipe()
            .atomic()
            .cmd("HSETNX")
            .arg(self.document_key(job_type))
            .arg(key)
            .arg(value)
            .cmd("SADD")
            .arg(self.types_key())
            .arg(job_type)
            .ignore()
            .query(&mut conn)
            .map_err(map_redis_error)?;
        Ok(created == 1)
    }

    fn find_all_job_types(&self) -> Result<BTreeSet<String>, RepositoryError> {
        let mut conn = self.connection()?;
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.types_key())
            .query(&mut conn)
            .map_err(map_redis_error)?;
        Ok(members.into_iter().collect())
    }

    fn get_job_meta(&self, job_type: &str) -> Result<JobMeta, RepositoryError> {
        let mut conn = self.connection()?;
        let document: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.document_key(job_type))
            .query(&mut conn)
            .map_err(map_redis_error)?;
        let document: BTreeMap<String, String> = document.into_iter().collect();
        Ok(JobMeta::from_document(job_type, &document))
    }

    #[instrument(skip(self, mutex_types), fields(job_type = %job_type, job_id = %job_id), err)]
    fn try_acquire_run_lock(
        &self,
        job_id: &str,
        job_type: &str,
        mutex_types: &BTreeSet<String>,
    ) -> Result<Result<(), BlockReason>, RepositoryError> {
        let others: Vec<&String> = mutex_types
            .iter()
            .filter(|other| other.as_str() != job_type)
            .collect();

        let mut invocation = self.acquire.prepare_invoke();
        invocation
            .key(self.types_key())
            .key(self.document_key(job_type))
            .arg(job_id)
            .arg(job_type)
            .arg(KEY_RUNNING)
            .arg(KEY_DISABLED);
        for other in &others {
            invocation.key(self.document_key(other));
        }
        for other in &others {
            invocation.arg(other.as_str());
        }

        let mut conn = self.connection()?;
        let reply: Vec<String> = invocation.invoke(&mut conn).map_err(map_redis_error)?;

        match reply.as_slice() {
            [status] if status == "ok" => Ok(Ok(())),
            [status, comment] if status == "disabled" => Ok(Err(BlockReason::Disabled {
                job_type: job_type.to_string(),
                comment: comment.clone(),
            })),
            [status, holder] if status == "running" => Ok(Err(BlockReason::AlreadyRunning {
                job_type: job_type.to_string(),
                job_id: holder.clone(),
            })),
            [status, blocked_by] if status == "mutex" => Ok(Err(BlockReason::MutexGroup {
                job_type: job_type.to_string(),
                blocked_by: blocked_by.clone(),
            })),
            other => Err(RepositoryError::Serialization(format!(
                "unexpected lock script reply: {other:?}"
            ))),
        }
    }

    fn release_run_lock(&self, job_type: &str) -> Result<(), RepositoryError> {
        self.hdel(job_type, KEY_RUNNING)
    }

    fn release_run_lock_held_by(
        &self,
        job_type: &str,
        job_id: &str,
    ) -> Result<bool, RepositoryError> {
        let mut conn = self.connection()?;
        let mut invocation = self.release_held_by.prepare_invoke();
        invocation
            .key(self.document_key(job_type))
            .arg(job_id)
            .arg(KEY_RUNNING);
        let released: i64 = invocation.invoke(&mut conn).map_err(map_redis_error)?;
        Ok(released == 1)
    }

    fn running_job(&self, job_type: &str) -> Result<Option<RunningJob>, RepositoryError> {
        Ok(self
            .get_value(job_type, KEY_RUNNING)?
            .map(|job_id| RunningJob::new(job_id, job_type)))
    }

    fn disable(&self, job_type: &str, comment: &str) -> Result<(), RepositoryError> {
        self.hset(job_type, KEY_DISABLED, comment)
    }

    fn enable(&self, job_type: &str) -> Result<(), RepositoryError> {
        self.hdel(job_type, KEY_DISABLED)
    }

    fn delete_all(&self) -> Result<(), RepositoryError> {
        let types = self.find_all_job_types()?;
        let mut conn = self.connection()?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for job_type in &types {
            pipe.cmd("DEL").arg(self.document_key(job_type)).ignore();
        }
        pipe.cmd("DEL").arg(self.types_key()).ignore();
        pipe.query::<()>(&mut conn).map_err(map_redis_error)
    }
}

fn map_redis_error(err: redis::RedisError) -> RepositoryError {
    match err.kind() {
        redis::ErrorKind::TypeError => RepositoryError::Serialization(err.to_string()),
        _ => RepositoryError::Unavailable(format!("redis error: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repository() -> RedisJobMetaRepository {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
        let repo =
            RedisJobMetaRepository::with_prefix(url, format!("jobguard-test-{}", uuid::Uuid::now_v7()))
                .unwrap();
        repo.delete_all().unwrap();
        repo
    }

    #[test]
    #[ignore = "requires a running Redis (REDIS_URL)"]
    fn group_acquisition_and_release() {
        let repo = repository();
        let group: BTreeSet<String> = ["A", "B"].iter().map(|s| s.to_string()).collect();

        assert_eq!(repo.try_acquire_run_lock("1", "A", &group).unwrap(), Ok(()));
        assert!(matches!(
            repo.try_acquire_run_lock("2", "B", &group).unwrap(),
            Err(BlockReason::MutexGroup { .. })
        ));
        assert!(!repo.release_run_lock_held_by("A", "2").unwrap());
        assert!(repo.release_run_lock_held_by("A", "1").unwrap());
        assert_eq!(repo.try_acquire_run_lock("2", "B", &group).unwrap(), Ok(()));

        repo.delete_all().unwrap();
    }

    #[test]
    #[ignore = "requires a running Redis (REDIS_URL)"]
    fn values_and_disabled_flag() {
        let repo = repository();

        assert!(repo.create_value("A", "k", "v1").unwrap());
        assert!(!repo.create_value("A", "k", "v2").unwrap());
        assert_eq!(
            repo.set_value("A", "k", None).unwrap().as_deref(),
            Some("v1")
        );

        repo.disable("A", "maintenance").unwrap();
        let meta = repo.get_job_meta("A").unwrap();
        assert_eq!(meta.disabled_comment(), "maintenance");
        assert!(repo.find_all_job_types().unwrap().contains("A"));

        repo.delete_all().unwrap();
    }
}
