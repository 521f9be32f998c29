//! Postgres-backed job store.
//!
//! ## Leasing
//!
//! Candidates are read without locks. The lease is a single conditional `UPDATE`
//! inside a transaction that only touches rows still unleased (or expired) at `now`.
//! When fewer rows are updated than requested, another worker won part of the race:
//! the transaction rolls back and [`JobStoreError::LeaseConflict`] is returned.
//!
//! ## Lease tokens
//!
//! `locked_at` doubles as the lease token. Every outcome write carries
//! `WHERE locked_at = $token`, so a worker whose lease was reclaimed updates nothing.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use super::store::{JobStats, JobStore, JobStoreError};
use super::types::{self, AttemptLog, FailureAction, Job, JobId, LeaseRequest, NewJob};

const JOB_COLUMNS: &str = r#"
    id, job_type, queue, payload, dispatched_at, locked_at, timeout_at,
    completed_at, dead_lettered_at, attempts_count, attempt_logs, created_at
"#;

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn insert(&self, jobs: Vec<Job>) -> Result<(), JobStoreError> {
        if jobs.is_empty() {
            return Ok(());
        }

        let mut builder = sqlx::QueryBuilder::<sqlx::Postgres>::new(
            "INSERT INTO jobs (id, job_type, queue, payload, dispatched_at, created_at) ",
        );
        builder.push_values(jobs, |mut row, job| {
            row.push_bind(job.id.as_uuid())
                .push_bind(job.job_type)
                .push_bind(job.queue)
                .push_bind(job.payload)
                .push_bind(job.dispatched_at)
                .push_bind(job.created_at);
        });
        builder
            .build()
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("dispatch", e))?;
        Ok(())
    }
}

fn log_entry(log: &AttemptLog) -> Result<serde_json::Value, JobStoreError> {
    serde_json::to_value([log]).map_err(|e| JobStoreError::Decode(e.to_string()))
}

#[async_trait::async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_type = %job.job_type, queue = %job.queue), err)]
    async fn dispatch(&self, job: NewJob) -> Result<JobId, JobStoreError> {
        let job = Job::from_new(job, types::now());
        let id = job.id;
        self.insert(vec![job]).await?;
        Ok(id)
    }

    #[instrument(skip(self, jobs), fields(count = jobs.len()), err)]
    async fn dispatch_many(&self, jobs: Vec<NewJob>) -> Result<Vec<JobId>, JobStoreError> {
        let at = types::now();
        let jobs: Vec<Job> = jobs.into_iter().map(|j| Job::from_new(j, at)).collect();
        let ids = jobs.iter().map(|j| j.id).collect();
        self.insert(jobs).await?;
        Ok(ids)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| decode_job(&r)).transpose()
    }

    #[instrument(skip(self, job_types), err)]
    async fn find_candidates(
        &self,
        queue: &str,
        job_types: &[String],
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE queue = $1
              AND job_type = ANY($2)
              AND (locked_at IS NULL OR timeout_at < $3)
              AND completed_at IS NULL
              AND dead_lettered_at IS NULL
              AND dispatched_at <= $3
            ORDER BY dispatched_at ASC, id ASC
            LIMIT $4
            "#
        ))
        .bind(queue)
        .bind(job_types)
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_candidates", e))?;

        rows.iter().map(decode_job).collect()
    }

    #[instrument(skip(self, requests), fields(requested = requests.len()), err)]
    async fn lease(
        &self,
        requests: &[LeaseRequest],
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = requests.iter().map(|r| r.job_id.as_uuid()).collect();
        let timeouts: Vec<DateTime<Utc>> = requests.iter().map(|r| r.timeout_at).collect();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let rows = sqlx::query(
            r#"
            UPDATE jobs AS j
            SET locked_at = $1, timeout_at = c.timeout_at
            FROM UNNEST($2::uuid[], $3::timestamptz[]) AS c(id, timeout_at)
            WHERE j.id = c.id
              AND (j.locked_at IS NULL OR j.timeout_at < $1)
              AND j.completed_at IS NULL
              AND j.dead_lettered_at IS NULL
            RETURNING j.*
            "#,
        )
        .bind(now)
        .bind(&ids)
        .bind(&timeouts)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("lease", e))?;

        if rows.len() != requests.len() {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(JobStoreError::LeaseConflict {
                requested: requests.len(),
                leased: rows.len(),
            });
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;

        rows.iter().map(decode_job).collect()
    }

    #[instrument(skip(self, log), fields(job_id = %id), err)]
    async fn complete(
        &self,
        id: JobId,
        lease: DateTime<Utc>,
        log: AttemptLog,
    ) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET completed_at = now(),
                locked_at = NULL,
                timeout_at = NULL,
                attempt_logs = attempt_logs || $3::jsonb
            WHERE id = $1 AND locked_at = $2
              AND completed_at IS NULL AND dead_lettered_at IS NULL
            "#,
        )
        .bind(id.as_uuid())
        .bind(lease)
        .bind(log_entry(&log)?)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, log), fields(job_id = %id), err)]
    async fn fail(
        &self,
        id: JobId,
        lease: DateTime<Utc>,
        log: AttemptLog,
        action: FailureAction,
    ) -> Result<bool, JobStoreError> {
        // NULL keeps the column as it is.
        let (retry_at, dead_letter) = match action {
            FailureAction::Retry => (None, false),
            FailureAction::RetryAt(at) => (Some(at), false),
            FailureAction::DeadLetter => (None, true),
        };

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET locked_at = NULL,
                timeout_at = NULL,
                dispatched_at = COALESCE($4, dispatched_at),
                dead_lettered_at = CASE WHEN $5 THEN now() ELSE NULL END,
                attempts_count = attempts_count + 1,
                attempt_logs = attempt_logs || $3::jsonb
            WHERE id = $1 AND locked_at = $2
              AND completed_at IS NULL AND dead_lettered_at IS NULL
            "#,
        )
        .bind(id.as_uuid())
        .bind(lease)
        .bind(log_entry(&log)?)
        .bind(retry_at)
        .bind(dead_letter)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn release(&self, id: JobId, lease: DateTime<Utc>) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET locked_at = NULL, timeout_at = NULL
            WHERE id = $1 AND locked_at = $2 AND completed_at IS NULL
            "#,
        )
        .bind(id.as_uuid())
        .bind(lease)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn list_queue(&self, queue: &str, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE queue = $1 ORDER BY dispatched_at ASC, id ASC LIMIT $2"
        ))
        .bind(queue)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_queue", e))?;

        rows.iter().map(decode_job).collect()
    }

    #[instrument(skip(self), err)]
    async fn stats(&self, queue: &str, now: DateTime<Utc>) -> Result<JobStats, JobStoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE completed_at IS NULL AND dead_lettered_at IS NULL
                                 AND (locked_at IS NULL OR timeout_at < $2)) AS pending,
                COUNT(*) FILTER (WHERE completed_at IS NULL AND dead_lettered_at IS NULL
                                 AND locked_at IS NOT NULL AND timeout_at >= $2) AS leased,
                COUNT(*) FILTER (WHERE completed_at IS NOT NULL) AS completed,
                COUNT(*) FILTER (WHERE completed_at IS NULL AND dead_lettered_at IS NOT NULL) AS dead_lettered
            FROM jobs
            WHERE queue = $1
            "#,
        )
        .bind(queue)
        .bind(now)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let count = |name: &str| -> Result<usize, JobStoreError> {
            let n: i64 = row
                .try_get(name)
                .map_err(|e| JobStoreError::Decode(e.to_string()))?;
            Ok(usize::try_from(n).unwrap_or(0))
        };

        Ok(JobStats {
            pending: count("pending")?,
            leased: count("leased")?,
            completed: count("completed")?,
            dead_lettered: count("dead_lettered")?,
        })
    }
}

/// Map SQLx errors to job store errors.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        other => JobStoreError::Storage(format!("database error in {}: {}", operation, other)),
    }
}

struct JobRow {
    id: Uuid,
    job_type: String,
    queue: String,
    payload: serde_json::Value,
    dispatched_at: DateTime<Utc>,
    locked_at: Option<DateTime<Utc>>,
    timeout_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    dead_lettered_at: Option<DateTime<Utc>>,
    attempts_count: i32,
    attempt_logs: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            job_type: row.try_get("job_type")?,
            queue: row.try_get("queue")?,
            payload: row.try_get("payload")?,
            dispatched_at: row.try_get("dispatched_at")?,
            locked_at: row.try_get("locked_at")?,
            timeout_at: row.try_get("timeout_at")?,
            completed_at: row.try_get("completed_at")?,
            dead_lettered_at: row.try_get("dead_lettered_at")?,
            attempts_count: row.try_get("attempts_count")?,
            attempt_logs: row.try_get("attempt_logs")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let attempt_logs: Vec<AttemptLog> = serde_json::from_value(row.attempt_logs)
            .map_err(|e| JobStoreError::Decode(format!("attempt_logs of {}: {}", row.id, e)))?;
        Ok(Job {
            id: JobId::from_uuid(row.id),
            job_type: row.job_type,
            queue: row.queue,
            payload: row.payload,
            dispatched_at: row.dispatched_at,
            locked_at: row.locked_at,
            timeout_at: row.timeout_at,
            completed_at: row.completed_at,
            dead_lettered_at: row.dead_lettered_at,
            attempts_count: u32::try_from(row.attempts_count).unwrap_or(0),
            attempt_logs,
            created_at: row.created_at,
        })
    }
}

fn decode_job(row: &sqlx::postgres::PgRow) -> Result<Job, JobStoreError> {
    JobRow::from_row(row)
        .map_err(|e| JobStoreError::Decode(format!("failed to decode job row: {}", e)))?
        .try_into()
}
