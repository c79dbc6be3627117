//! Postgres-backed job repository.
//!
//! One row per execution in the `jobs` table; the message history lives in a
//! JSONB array. Heartbeats and message appends are single
//! `UPDATE ... WHERE stopped IS NULL` statements, so concurrent writers never
//! overwrite each other and a stopped row is never touched again. Status
//! transitions and truncation lock the row and apply the `JobInfo` rules.
//!
//! ## Error Mapping
//!
//! | SQLx Error | RepositoryError |
//! |------------|-----------------|
//! | Database / Io / PoolTimedOut / PoolClosed | `Unavailable` |
//! | ColumnDecode / Decode | `Serialization` |
//! | zero rows affected on a guarded update | `AlreadyStopped` or `NotFound` (re-checked) |
//! | rejected status transition | `Domain(Conflict)` / `Domain(InvariantViolation)` |
//!
//! ## Thread Safety
//!
//! `PostgresJobRepository` owns a small tokio runtime and blocks on it, so the
//! synchronous [`JobRepository`] trait can be called from plain worker threads.
//! Do not call it from inside another tokio runtime.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{FromRow, Row};
use tracing::instrument;
use uuid::Uuid;

use jobguard_core::{JobId, JobInfo, JobMessage, JobStatus};

use super::r#trait::{JobRepository, newest_first};
use crate::error::RepositoryError;

const SELECT_COLUMNS: &str =
    "job_id, job_type, started, last_updated, stopped, status, messages, hostname";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    job_id UUID PRIMARY KEY,
    job_type TEXT NOT NULL,
    started TIMESTAMPTZ NOT NULL,
    last_updated TIMESTAMPTZ NOT NULL,
    stopped TIMESTAMPTZ NULL,
    status TEXT NOT NULL,
    messages JSONB NOT NULL DEFAULT '[]'::jsonb,
    hostname TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS jobs_type_started_idx ON jobs (job_type, started DESC, job_id DESC);
CREATE INDEX IF NOT EXISTS jobs_running_idx ON jobs (last_updated) WHERE stopped IS NULL;
"#;

/// Postgres job repository.
#[derive(Debug, Clone)]
pub struct PostgresJobRepository {
    pool: PgPool,
    runtime: Arc<tokio::runtime::Runtime>,
}

impl PostgresJobRepository {
    /// Connect to `database_url` with a pool of at most `max_connections`.
    pub fn connect(database_url: &str, max_connections: u32) -> Result<Self, RepositoryError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("jobguard-postgres")
            .enable_all()
            .build()
            .map_err(|e| RepositoryError::unavailable(format!("failed to build runtime: {e}")))?;

        let pool = runtime
            .block_on(
                PgPoolOptions::new()
                    .max_connections(max_connections)
                    .connect(database_url),
            )
            .map_err(|e| map_sqlx_error("connect", e))?;

        Ok(Self {
            pool,
            runtime: Arc::new(runtime),
        })
    }

    /// Create the `jobs` table and its indexes if missing.
    pub fn ensure_schema(&self) -> Result<(), RepositoryError> {
        self.runtime.block_on(async {
            sqlx::raw_sql(SCHEMA)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
            Ok(())
        })
    }

    fn fetch_jobs(
        &self,
        operation: &'static str,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<JobInfo>, RepositoryError> {
        let rows = self
            .runtime
            .block_on(query.fetch_all(&self.pool))
            .map_err(|e| map_sqlx_error(operation, e))?;
        rows.iter().map(job_from_row).collect()
    }

    /// A guarded update touched no row: tell "missing" from "stopped".
    async fn missing_or_stopped(&self, job_id: JobId) -> RepositoryError {
        let row = sqlx::query("SELECT stopped IS NOT NULL AS is_stopped FROM jobs WHERE job_id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&self.pool)
            .await;
        match row {
            Ok(Some(row)) => match row.try_get::<bool, _>("is_stopped") {
                Ok(true) => RepositoryError::AlreadyStopped(job_id),
                Ok(false) => RepositoryError::unavailable(format!(
                    "update of running job {job_id} affected no rows"
                )),
                Err(e) => map_sqlx_error("missing_or_stopped", e),
            },
            Ok(None) => RepositoryError::NotFound(job_id),
            Err(e) => map_sqlx_error("missing_or_stopped", e),
        }
    }

    async fn guarded_update(
        &self,
        operation: &'static str,
        job_id: JobId,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<(), RepositoryError> {
        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        if result.rows_affected() == 0 {
            return Err(self.missing_or_stopped(job_id).await);
        }
        Ok(())
    }

    /// Read-modify-write of one row under `SELECT ... FOR UPDATE`.
    ///
    /// Nothing is written when `apply` fails.
    fn update_locked<F>(
        &self,
        operation: &'static str,
        job_id: JobId,
        apply: F,
    ) -> Result<(), RepositoryError>
    where
        F: FnOnce(&mut JobInfo) -> Result<(), jobguard_core::DomainError>,
    {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM jobs WHERE job_id = $1 FOR UPDATE");
        self.runtime.block_on(async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| map_sqlx_error(operation, e))?;

            let row = sqlx::query(&sql)
                .bind(job_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error(operation, e))?
                .ok_or(RepositoryError::NotFound(job_id))?;
            let mut job = job_from_row(&row)?;
            apply(&mut job)?;

            sqlx::query(
                "UPDATE jobs SET messages = $2, last_updated = $3, status = $4 WHERE job_id = $1",
            )
            .bind(job_id.as_uuid())
            .bind(serde_json::to_value(&job.messages)?)
            .bind(job.last_updated)
            .bind(job.status.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

            tx.commit().await.map_err(|e| map_sqlx_error(operation, e))
        })
    }
}

/// `LIMIT` value for a `usize`; values past `i64::MAX` mean "no limit".
fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

impl JobRepository for PostgresJobRepository {
    #[instrument(skip(self), fields(job_id = %job_id), err)]
    fn find_one(&self, job_id: JobId) -> Result<Option<JobInfo>, RepositoryError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM jobs WHERE job_id = $1");
        let row = self
            .runtime
            .block_on(
                sqlx::query(&sql)
                    .bind(job_id.as_uuid())
                    .fetch_optional(&self.pool),
            )
            .map_err(|e| map_sqlx_error("find_one", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    fn find_all(&self) -> Result<Vec<JobInfo>, RepositoryError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM jobs ORDER BY started DESC, job_id DESC");
        self.fetch_jobs("find_all", sqlx::query(&sql))
    }

    fn find_by_type(&self, job_type: &str) -> Result<Vec<JobInfo>, RepositoryError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM jobs WHERE job_type = $1 ORDER BY started DESC, job_id DESC"
        );
        self.fetch_jobs("find_by_type", sqlx::query(&sql).bind(job_type))
    }

    fn find_latest(&self, limit: usize) -> Result<Vec<JobInfo>, RepositoryError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM jobs ORDER BY started DESC, job_id DESC LIMIT $1"
        );
        self.fetch_jobs("find_latest", sqlx::query(&sql).bind(sql_limit(limit)))
    }

    fn find_latest_by(
        &self,
        job_type: &str,
        limit: usize,
    ) -> Result<Vec<JobInfo>, RepositoryError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM jobs WHERE job_type = $1 \
             ORDER BY started DESC, job_id DESC LIMIT $2"
        );
        self.fetch_jobs(
            "find_latest_by",
            sqlx::query(&sql).bind(job_type).bind(sql_limit(limit)),
        )
    }

    fn find_latest_jobs_distinct(&self) -> Result<Vec<JobInfo>, RepositoryError> {
        let sql = format!(
            "SELECT DISTINCT ON (job_type) {SELECT_COLUMNS} FROM jobs \
             ORDER BY job_type, started DESC, job_id DESC"
        );
        let mut jobs = self.fetch_jobs("find_latest_jobs_distinct", sqlx::query(&sql))?;
        jobs.sort_by(newest_first);
        Ok(jobs)
    }

    fn find_running_without_update_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<JobInfo>, RepositoryError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM jobs WHERE stopped IS NULL AND last_updated < $1 \
             ORDER BY started DESC, job_id DESC"
        );
        self.fetch_jobs(
            "find_running_without_update_since",
            sqlx::query(&sql).bind(since),
        )
    }

    fn find_all_job_types(&self) -> Result<Vec<String>, RepositoryError> {
        let rows = self
            .runtime
            .block_on(
                sqlx::query("SELECT DISTINCT job_type FROM jobs ORDER BY job_type")
                    .fetch_all(&self.pool),
            )
            .map_err(|e| map_sqlx_error("find_all_job_types", e))?;
        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("job_type")
                    .map_err(|e| map_sqlx_error("find_all_job_types", e))
            })
            .collect()
    }

    #[instrument(skip(self, job), fields(job_id = %job.job_id, job_type = %job.job_type), err)]
    fn create_or_update(&self, job: JobInfo) -> Result<JobInfo, RepositoryError> {
        let messages = serde_json::to_value(&job.messages)?;
        let result = self
            .runtime
            .block_on(
                sqlx::query(
                    r#"
                    INSERT INTO jobs (job_id, job_type, started, last_updated, stopped, status, messages, hostname)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    ON CONFLICT (job_id) DO UPDATE SET
                        job_type = EXCLUDED.job_type,
                        started = EXCLUDED.started,
                        last_updated = EXCLUDED.last_updated,
                        stopped = EXCLUDED.stopped,
                        status = EXCLUDED.status,
                        messages = EXCLUDED.messages,
                        hostname = EXCLUDED.hostname
                    WHERE jobs.stopped IS NULL
                    "#,
                )
                .bind(job.job_id.as_uuid())
                .bind(&job.job_type)
                .bind(job.started)
                .bind(job.last_updated)
                .bind(job.stopped)
                .bind(job.status.as_str())
                .bind(messages)
                .bind(&job.hostname)
                .execute(&self.pool),
            )
            .map_err(|e| map_sqlx_error("create_or_update", e))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::AlreadyStopped(job.job_id));
        }
        Ok(job)
    }

    fn remove_if_stopped(&self, job_id: JobId) -> Result<bool, RepositoryError> {
        let result = self
            .runtime
            .block_on(
                sqlx::query("DELETE FROM jobs WHERE job_id = $1 AND stopped IS NOT NULL")
                    .bind(job_id.as_uuid())
                    .execute(&self.pool),
            )
            .map_err(|e| map_sqlx_error("remove_if_stopped", e))?;
        Ok(result.rows_affected() > 0)
    }

    fn append_message(&self, job_id: JobId, message: JobMessage) -> Result<(), RepositoryError> {
        let is_error = message.level == jobguard_core::Level::Error;
        let timestamp = message.timestamp;
        let entry = serde_json::to_value(vec![message])?;
        self.runtime.block_on(
            self.guarded_update(
                "append_message",
                job_id,
                sqlx::query(
                    r#"
                    UPDATE jobs SET
                        messages = messages || $2,
                        last_updated = GREATEST(last_updated, $3),
                        status = CASE WHEN $4 THEN 'ERROR' ELSE status END
                    WHERE job_id = $1 AND stopped IS NULL
                    "#,
                )
                .bind(job_id.as_uuid())
                .bind(entry)
                .bind(timestamp)
                .bind(is_error),
            ),
        )
    }

    fn set_job_status(&self, job_id: JobId, status: JobStatus) -> Result<(), RepositoryError> {
        if status == JobStatus::Dead {
            return Err(
                jobguard_core::DomainError::invariant("DEAD can only be set when stopping a job")
                    .into(),
            );
        }
        self.update_locked("set_job_status", job_id, |job| match (job.status, status) {
            (JobStatus::Error, JobStatus::Skipped) => job.ensure_running(),
            _ => job.set_status(status),
        })
    }

    fn mark_skipped(&self, job_id: JobId, at: DateTime<Utc>) -> Result<(), RepositoryError> {
        self.update_locked("mark_skipped", job_id, |job| job.mark_skipped(at))
    }

    fn mark_restarted(&self, job_id: JobId, at: DateTime<Utc>) -> Result<(), RepositoryError> {
        self.update_locked("mark_restarted", job_id, |job| job.mark_restarted(at))
    }

    fn set_last_update(&self, job_id: JobId, at: DateTime<Utc>) -> Result<(), RepositoryError> {
        self.runtime.block_on(
            self.guarded_update(
                "set_last_update",
                job_id,
                sqlx::query(
                    "UPDATE jobs SET last_updated = GREATEST(last_updated, $2) \
                     WHERE job_id = $1 AND stopped IS NULL",
                )
                .bind(job_id.as_uuid())
                .bind(at),
            ),
        )
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    fn stop_job(
        &self,
        job_id: JobId,
        at: DateTime<Utc>,
        status: Option<JobStatus>,
    ) -> Result<JobInfo, RepositoryError> {
        let sql = format!(
            r#"
            UPDATE jobs SET
                stopped = GREATEST($2, started, last_updated),
                last_updated = GREATEST($2, started, last_updated),
                status = COALESCE($3, status)
            WHERE job_id = $1 AND stopped IS NULL
            RETURNING {SELECT_COLUMNS}
            "#
        );
        self.runtime.block_on(async {
            let row = sqlx::query(&sql)
                .bind(job_id.as_uuid())
                .bind(at)
                .bind(status.map(|s| s.as_str()))
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("stop_job", e))?;
            match row {
                Some(row) => job_from_row(&row),
                None => Err(self.missing_or_stopped(job_id).await),
            }
        })
    }

    fn truncate_messages(
        &self,
        job_id: JobId,
        keep_last: usize,
        note: JobMessage,
    ) -> Result<(), RepositoryError> {
        self.update_locked("truncate_messages", job_id, |job| {
            job.truncate_messages(keep_last, note)
        })
    }

    fn count(&self) -> Result<usize, RepositoryError> {
        let row = self
            .runtime
            .block_on(sqlx::query("SELECT COUNT(*) AS total FROM jobs").fetch_one(&self.pool))
            .map_err(|e| map_sqlx_error("count", e))?;
        let total: i64 = row
            .try_get("total")
            .map_err(|e| map_sqlx_error("count", e))?;
        Ok(total as usize)
    }

    fn clear_all(&self) -> Result<(), RepositoryError> {
        self.runtime
            .block_on(sqlx::query("DELETE FROM jobs").execute(&self.pool))
            .map_err(|e| map_sqlx_error("clear_all", e))?;
        Ok(())
    }
}

#[derive(Debug)]
struct JobRow {
    job_id: Uuid,
    job_type: String,
    started: DateTime<Utc>,
    last_updated: DateTime<Utc>,
    stopped: Option<DateTime<Utc>>,
    status: String,
    messages: serde_json::Value,
    hostname: String,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            job_id: row.try_get("job_id")?,
            job_type: row.try_get("job_type")?,
            started: row.try_get("started")?,
            last_updated: row.try_get("last_updated")?,
            stopped: row.try_get("stopped")?,
            status: row.try_get("status")?,
            messages: row.try_get("messages")?,
            hostname: row.try_get("hostname")?,
        })
    }
}

fn job_from_row(row: &PgRow) -> Result<JobInfo, RepositoryError> {
    let row = JobRow::from_row(row).map_err(|e| map_sqlx_error("decode_job", e))?;
    Ok(JobInfo {
        job_id: JobId::from_uuid(row.job_id),
        job_type: row.job_type,
        started: row.started,
        last_updated: row.last_updated,
        stopped: row.stopped,
        status: row
            .status
            .parse()
            .map_err(|e: jobguard_core::DomainError| RepositoryError::Serialization(e.to_string()))?,
        messages: serde_json::from_value(row.messages)?,
        hostname: row.hostname,
    })
}

/// Map SQLx errors to RepositoryError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            RepositoryError::Serialization(format!("decode error in {operation}: {err}"))
        }
        sqlx::Error::Database(db_err) => RepositoryError::Unavailable(format!(
            "database error in {operation}: {}",
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            RepositoryError::Unavailable(format!("connection pool closed in {operation}"))
        }
        other => RepositoryError::Unavailable(format!("sqlx error in {operation}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repository() -> PostgresJobRepository {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let repo = PostgresJobRepository::connect(&url, 2).unwrap();
        repo.ensure_schema().unwrap();
        repo.clear_all().unwrap();
        repo
    }

    #[test]
    #[ignore = "requires DATABASE_URL pointing to a Postgres instance"]
    fn stop_is_final() {
        let repo = repository();
        let job = repo
            .create_or_update(JobInfo::new(JobId::new(), "PgJob", Utc::now(), "host"))
            .unwrap();

        repo.append_message(job.job_id, JobMessage::error("boom", Utc::now()))
            .unwrap();
        let stopped = repo.stop_job(job.job_id, Utc::now(), None).unwrap();
        assert_eq!(stopped.status, JobStatus::Error);

        assert_eq!(
            repo.set_last_update(job.job_id, Utc::now()),
            Err(RepositoryError::AlreadyStopped(job.job_id))
        );
        assert!(repo.remove_if_stopped(job.job_id).unwrap());
    }

    #[test]
    #[ignore = "requires DATABASE_URL pointing to a Postgres instance"]
    fn truncates_running_job_messages() {
        let repo = repository();
        let job = repo
            .create_or_update(JobInfo::new(JobId::new(), "PgJob", Utc::now(), "host"))
            .unwrap();
        for i in 0..5 {
            repo.append_message(job.job_id, JobMessage::info(format!("m{i}"), Utc::now()))
                .unwrap();
        }

        repo.truncate_messages(job.job_id, 2, JobMessage::info("note", Utc::now()))
            .unwrap();

        let stored = repo.find_one(job.job_id).unwrap().unwrap();
        let texts: Vec<_> = stored.messages.iter().map(|m| m.message.as_str()).collect();
        assert_eq!(texts, vec!["m4", "note"]);
    }

    #[test]
    fn limit_saturates_instead_of_wrapping() {
        assert_eq!(sql_limit(10), 10);
        assert_eq!(sql_limit(usize::MAX), i64::MAX);
    }

    #[test]
    #[ignore = "requires DATABASE_URL pointing to a Postgres instance"]
    fn error_only_reverts_through_restart() {
        let repo = repository();
        let job = repo
            .create_or_update(JobInfo::new(JobId::new(), "PgJob", Utc::now(), "host"))
            .unwrap();
        repo.append_message(job.job_id, JobMessage::error("boom", Utc::now()))
            .unwrap();

        assert!(matches!(
            repo.set_job_status(job.job_id, JobStatus::Ok),
            Err(RepositoryError::Domain(jobguard_core::DomainError::Conflict(_)))
        ));
        repo.mark_skipped(job.job_id, Utc::now()).unwrap();
        assert_eq!(repo.find_one(job.job_id).unwrap().unwrap().status, JobStatus::Error);

        repo.mark_restarted(job.job_id, Utc::now()).unwrap();
        assert_eq!(repo.find_one(job.job_id).unwrap().unwrap().status, JobStatus::Ok);
    }
}
