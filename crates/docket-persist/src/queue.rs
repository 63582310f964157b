//! Durable queue backend using SQLite

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use docket_queue::job::chrono_duration;
use docket_queue::{
    BackendError, Job, JobId, JobOptions, JobStatus, Payload, QueueBackend, QueueCounts,
};
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::sqlite::{self, SqliteConfig};

/// Jobs live in one `jobs` table; each state transition is a single
/// conditional `UPDATE ... RETURNING`, so concurrent workers never claim the
/// same row.
///
/// Timestamps written by this handle come from a clock that never moves
/// backwards, so a wall-clock step cannot reorder jobs already in line.
#[derive(Debug, Clone)]
pub struct SqliteQueueBackend {
    pool: SqlitePool,
    clock: Arc<AtomicI64>,
}

impl SqliteQueueBackend {
    /// Wrap a pool whose schema is already migrated.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            clock: Arc::new(AtomicI64::new(i64::MIN)),
        }
    }

    pub async fn connect(config: &SqliteConfig) -> Result<Self, BackendError> {
        let pool = sqlite::connect(config).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Unix milliseconds, never less than any earlier reading.
    fn now_ms(&self) -> i64 {
        let wall = Utc::now().timestamp_millis();
        self.clock.fetch_max(wall, Ordering::SeqCst).max(wall)
    }

    async fn fetch(&self, id: JobId) -> Result<Option<Job>, BackendError> {
        sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?
            .map(JobRow::into_job)
            .transpose()
    }
}

#[async_trait]
impl QueueBackend for SqliteQueueBackend {
    async fn push(&self, job: Job) -> Result<(), BackendError> {
        let payload = serde_json::to_string(&job.payload)?;
        let result = job.result.as_ref().map(serde_json::to_string).transpose()?;
        let run_at = job.run_at.timestamp_millis().max(self.now_ms());

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, queue, payload, status, attempt, max_attempts, backoff_base_ms, timeout_ms,
                enqueued_at, run_at, started_at, finished_at, last_error, result
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.id.to_string())
        .bind(&job.queue_name)
        .bind(payload)
        .bind(job.status.as_str())
        .bind(i64::from(job.attempt))
        .bind(i64::from(job.options.max_attempts))
        .bind(to_i64(job.options.backoff_base_ms))
        .bind(to_i64(job.options.timeout_ms))
        .bind(job.enqueued_at.timestamp_millis())
        .bind(run_at)
        .bind(job.started_at.map(|t| t.timestamp_millis()))
        .bind(job.finished_at.map(|t| t.timestamp_millis()))
        .bind(&job.last_error)
        .bind(result)
        .execute(&self.pool)
        .await
        .map_err(db)?;

        Ok(())
    }

    async fn claim(&self, queue: &str) -> Result<Option<Job>, BackendError> {
        let now = self.now_ms();

        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET status = 'active', started_at = ?
            WHERE status = 'waiting' AND id = (
                SELECT id FROM jobs
                WHERE queue = ? AND status = 'waiting' AND run_at <= ?
                ORDER BY run_at ASC, rowid ASC
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(queue)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;

        row.map(JobRow::into_job).transpose()
    }

    async fn complete(&self, id: JobId, result: Payload) -> Result<Job, BackendError> {
        let result = serde_json::to_string(&result)?;

        sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET status = 'completed', finished_at = ?, last_error = NULL, result = ?
            WHERE id = ? AND status = 'active'
            RETURNING *
            "#,
        )
        .bind(self.now_ms())
        .bind(result)
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?
        .ok_or(BackendError::NotFound(id))?
        .into_job()
    }

    async fn retry(&self, id: JobId, delay: Duration, error: &str) -> Result<Job, BackendError> {
        let now = self.now_ms();
        let run_at = now.saturating_add(chrono_duration(delay).num_milliseconds());

        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET status = 'waiting', attempt = attempt + 1, finished_at = ?, run_at = ?, last_error = ?
            WHERE id = ? AND status = 'active' AND attempt < max_attempts
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(run_at)
        .bind(error)
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;

        match row {
            Some(row) => {
                let job = row.into_job()?;
                debug!(
                    job_id = %id,
                    attempt = job.attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Re-queuing job with backoff"
                );
                Ok(job)
            }
            None => match self.fetch(id).await? {
                Some(job) if job.status == JobStatus::Active => Err(BackendError::Backend(
                    format!("job {id} has no attempts left"),
                )),
                _ => Err(BackendError::NotFound(id)),
            },
        }
    }

    async fn fail(&self, id: JobId, error: &str) -> Result<Job, BackendError> {
        sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET status = 'failed', finished_at = ?, last_error = ?
            WHERE id = ? AND status = 'active'
            RETURNING *
            "#,
        )
        .bind(self.now_ms())
        .bind(error)
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?
        .ok_or(BackendError::NotFound(id))?
        .into_job()
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, BackendError> {
        self.fetch(id).await
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts, BackendError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs WHERE queue = ? GROUP BY status")
                .bind(queue)
                .fetch_all(&self.pool)
                .await
                .map_err(db)?;

        let mut counts = QueueCounts::default();
        for (status, count) in rows {
            let count = u64::try_from(count).unwrap_or_default();
            match status.parse::<JobStatus>().map_err(BackendError::Backend)? {
                JobStatus::Waiting => counts.waiting = count,
                JobStatus::Active => counts.active = count,
                JobStatus::Completed => counts.completed = count,
                JobStatus::Failed => counts.failed = count,
            }
        }
        Ok(counts)
    }

    async fn reclaim_stale(&self, queue: &str) -> Result<u64, BackendError> {
        let now = self.now_ms();

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'waiting', run_at = ?
            WHERE queue = ? AND status = 'active' AND started_at + timeout_ms <= ?
            "#,
        )
        .bind(now)
        .bind(queue)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db)?;

        Ok(result.rows_affected())
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.pool.close().await;
        Ok(())
    }
}

/// Raw `jobs` row.
#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: String,
    queue: String,
    payload: String,
    status: String,
    attempt: i64,
    max_attempts: i64,
    backoff_base_ms: i64,
    timeout_ms: i64,
    enqueued_at: i64,
    run_at: i64,
    started_at: Option<i64>,
    finished_at: Option<i64>,
    last_error: Option<String>,
    result: Option<String>,
}

impl JobRow {
    fn into_job(self) -> Result<Job, BackendError> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| BackendError::backend(format!("invalid job id '{}': {e}", self.id)))?;

        Ok(Job {
            id,
            queue_name: self.queue,
            payload: serde_json::from_str(&self.payload)?,
            attempt: to_u32(self.attempt, "attempt")?,
            options: JobOptions {
                max_attempts: to_u32(self.max_attempts, "max_attempts")?,
                backoff_base_ms: to_u64(self.backoff_base_ms, "backoff_base_ms")?,
                timeout_ms: to_u64(self.timeout_ms, "timeout_ms")?,
            },
            status: self.status.parse().map_err(BackendError::Backend)?,
            enqueued_at: timestamp(self.enqueued_at)?,
            run_at: timestamp(self.run_at)?,
            started_at: self.started_at.map(timestamp).transpose()?,
            finished_at: self.finished_at.map(timestamp).transpose()?,
            last_error: self.last_error,
            result: self
                .result
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
        })
    }
}

fn db(e: sqlx::Error) -> BackendError {
    BackendError::backend(e)
}

fn timestamp(ms: i64) -> Result<DateTime<Utc>, BackendError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| BackendError::backend(format!("timestamp out of range: {ms}")))
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u32(value: i64, column: &str) -> Result<u32, BackendError> {
    u32::try_from(value).map_err(|_| BackendError::backend(format!("{column} out of range: {value}")))
}

fn to_u64(value: i64, column: &str) -> Result<u64, BackendError> {
    u64::try_from(value).map_err(|_| BackendError::backend(format!("{column} out of range: {value}")))
}
