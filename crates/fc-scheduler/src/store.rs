//! Job persistence.
//!
//! All status transitions are conditional updates
//! (`UPDATE … WHERE id = ? AND status = ?`) so concurrent replicas stay
//! safe without coordination. Timestamps are epoch milliseconds.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use fc_common::DeliveryReport;

use crate::{DispatchJob, DispatchMode, JobStatus, Result, SchedulerError};

pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes. Safe to repeat.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dispatch_jobs (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                mode TEXT NOT NULL,
                message_group TEXT NOT NULL DEFAULT 'default',
                sequence INTEGER NOT NULL DEFAULT 0,
                dispatch_pool_id TEXT NOT NULL,
                target_url TEXT NOT NULL,
                payload TEXT,
                timeout_seconds INTEGER NOT NULL DEFAULT 30,
                max_retries INTEGER NOT NULL DEFAULT 3,
                retry_strategy TEXT,
                scheduled_for INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                completed_at INTEGER,
                duration_millis INTEGER,
                last_error TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_dispatch_jobs_due
            ON dispatch_jobs (status, scheduled_for, expires_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_dispatch_jobs_group
            ON dispatch_jobs (message_group, sequence, created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dispatch_job_attempts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                attempt_number INTEGER NOT NULL,
                attempted_at INTEGER NOT NULL,
                completed_at INTEGER,
                duration_millis INTEGER,
                status TEXT NOT NULL,
                response_code INTEGER,
                response_body TEXT,
                error_message TEXT,
                error_type TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_dispatch_job_attempts_job
            ON dispatch_job_attempts (job_id, attempt_number)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("dispatch job schema initialized");
        Ok(())
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    fn to_datetime(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
    }

    fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Result<DispatchJob> {
        let payload: Option<String> = row.get("payload");
        let payload = payload
            .map(|p| serde_json::from_str(&p))
            .transpose()
            .map_err(|e| SchedulerError::Database(format!("corrupt payload column: {e}")))?;

        Ok(DispatchJob {
            id: row.get("id"),
            status: JobStatus::parse(row.get("status"))?,
            mode: DispatchMode::parse(row.get("mode"))?,
            message_group: row.get("message_group"),
            sequence: row.get("sequence"),
            dispatch_pool_id: row.get("dispatch_pool_id"),
            target_url: row.get("target_url"),
            payload,
            timeout_seconds: row.get::<i64, _>("timeout_seconds") as u32,
            max_retries: row.get::<i64, _>("max_retries") as u32,
            retry_strategy: row.get("retry_strategy"),
            scheduled_for: Self::to_datetime(row.get("scheduled_for")),
            expires_at: Self::to_datetime(row.get("expires_at")),
            attempt_count: row.get::<i64, _>("attempt_count") as u32,
            created_at: Self::to_datetime(row.get("created_at")),
            updated_at: Self::to_datetime(row.get("updated_at")),
        })
    }

    pub async fn insert(&self, job: &DispatchJob) -> Result<()> {
        let payload = job
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO dispatch_jobs
                (id, status, mode, message_group, sequence, dispatch_pool_id,
                 target_url, payload, timeout_seconds, max_retries,
                 retry_strategy, scheduled_for, expires_at, attempt_count,
                 created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            "#,
        )
        .bind(&job.id)
        .bind(job.status.as_str())
        .bind(job.mode.as_str())
        .bind(&job.message_group)
        .bind(job.sequence)
        .bind(&job.dispatch_pool_id)
        .bind(&job.target_url)
        .bind(payload)
        .bind(i64::from(job.timeout_seconds))
        .bind(i64::from(job.max_retries))
        .bind(&job.retry_strategy)
        .bind(job.scheduled_for.timestamp_millis())
        .bind(job.expires_at.timestamp_millis())
        .bind(i64::from(job.attempt_count))
        .bind(job.created_at.timestamp_millis())
        .bind(job.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<DispatchJob>> {
        let row = sqlx::query("SELECT * FROM dispatch_jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_job).transpose()
    }

    /// Due PENDING rows: scheduled and not yet expired, ordered by
    /// `(message_group, sequence, created_at)`.
    pub async fn fetch_due_pending(&self, limit: u32) -> Result<Vec<DispatchJob>> {
        let now = Self::now_ms();
        let rows = sqlx::query(
            r#"
            SELECT * FROM dispatch_jobs
            WHERE status = 'PENDING' AND scheduled_for <= ?1 AND expires_at > ?1
            ORDER BY message_group ASC, sequence ASC, created_at ASC
            LIMIT ?2
            "#,
        )
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_job).collect()
    }

    /// Groups among `groups` holding a FAILED block-on-error row; the whole
    /// group is withheld while any such row exists.
    pub async fn blocked_groups(&self, groups: &HashSet<String>) -> Result<HashSet<String>> {
        if groups.is_empty() {
            return Ok(HashSet::new());
        }

        let placeholders = (0..groups.len())
            .map(|i| format!("?{}", i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT DISTINCT message_group FROM dispatch_jobs \
             WHERE mode = 'BLOCK_ON_ERROR' AND status = 'FAILED' \
             AND message_group IN ({placeholders})"
        );

        let mut query = sqlx::query(&sql);
        for group in groups {
            query = query.bind(group);
        }

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|row| row.get("message_group"))
            .collect())
    }

    /// PENDING → QUEUED. Returns false when the row moved on concurrently.
    pub async fn mark_queued(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE dispatch_jobs
            SET status = 'QUEUED', updated_at = ?1
            WHERE id = ?2 AND status = 'PENDING'
            "#,
        )
        .bind(Self::now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// QUEUED → PENDING after a publish failure; counts the attempt.
    pub async fn restore_pending(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE dispatch_jobs
            SET status = 'PENDING', attempt_count = attempt_count + 1, updated_at = ?1
            WHERE id = ?2 AND status = 'QUEUED'
            "#,
        )
        .bind(Self::now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// PENDING|QUEUED past expiry → EXPIRED. Returns the affected ids.
    pub async fn sweep_expired(&self) -> Result<Vec<String>> {
        let now = Self::now_ms();
        let rows = sqlx::query(
            r#"
            UPDATE dispatch_jobs
            SET status = 'EXPIRED', updated_at = ?1
            WHERE status IN ('PENDING', 'QUEUED') AND expires_at <= ?1
            RETURNING id
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|row| row.get("id")).collect())
    }

    /// Stuck QUEUED rows back to PENDING. The attempt count is left alone:
    /// a lost queue message is not a delivery attempt.
    pub async fn reclaim_stale_queued(&self, threshold: Duration) -> Result<u64> {
        let cutoff = Self::now_ms() - threshold.as_millis() as i64;
        let result = sqlx::query(
            r#"
            UPDATE dispatch_jobs
            SET status = 'PENDING', updated_at = ?1
            WHERE status = 'QUEUED' AND updated_at < ?2
            "#,
        )
        .bind(Self::now_ms())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Terminal completion: QUEUED → SUCCESS|FAILED plus an attempt row.
    pub async fn record_completion(
        &self,
        id: &str,
        status: JobStatus,
        report: &DeliveryReport,
    ) -> Result<bool> {
        debug_assert!(matches!(status, JobStatus::Success | JobStatus::Failed));

        let now = Self::now_ms();
        let result = sqlx::query(
            r#"
            UPDATE dispatch_jobs
            SET status = ?1,
                attempt_count = attempt_count + 1,
                completed_at = ?2,
                duration_millis = ?3,
                last_error = ?4,
                updated_at = ?2
            WHERE id = ?5 AND status = 'QUEUED'
            "#,
        )
        .bind(status.as_str())
        .bind(now)
        .bind(report.duration_ms as i64)
        .bind(&report.error_message)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(job_id = %id, "completion for a job no longer QUEUED, skipping");
            return Ok(false);
        }

        let attempt_number: i64 =
            sqlx::query("SELECT attempt_count FROM dispatch_jobs WHERE id = ?1")
                .bind(id)
                .fetch_one(&self.pool)
                .await?
                .get("attempt_count");

        sqlx::query(
            r#"
            INSERT INTO dispatch_job_attempts
                (job_id, attempt_number, attempted_at, completed_at,
                 duration_millis, status, response_code, response_body,
                 error_message, error_type)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(id)
        .bind(attempt_number)
        .bind(now - report.duration_ms as i64)
        .bind(now)
        .bind(report.duration_ms as i64)
        .bind(status.as_str())
        .bind(report.status_code.map(i64::from))
        .bind(&report.response_body)
        .bind(&report.error_message)
        .bind(report.error_kind.map(|k| k.to_string()))
        .execute(&self.pool)
        .await?;

        Ok(true)
    }

    pub async fn count_by_status(&self, status: JobStatus) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM dispatch_jobs WHERE status = ?1")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    pub async fn attempts_for(&self, job_id: &str) -> Result<Vec<JobAttempt>> {
        let rows = sqlx::query(
            r#"
            SELECT attempt_number, attempted_at, completed_at, duration_millis,
                   status, response_code, response_body, error_message, error_type
            FROM dispatch_job_attempts
            WHERE job_id = ?1
            ORDER BY attempt_number ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| JobAttempt {
                attempt_number: row.get::<i64, _>("attempt_number") as u32,
                attempted_at: Self::to_datetime(row.get("attempted_at")),
                completed_at: row
                    .get::<Option<i64>, _>("completed_at")
                    .map(Self::to_datetime),
                duration_millis: row.get::<Option<i64>, _>("duration_millis").map(|d| d as u64),
                status: row.get("status"),
                response_code: row.get::<Option<i64>, _>("response_code").map(|c| c as u16),
                response_body: row.get("response_body"),
                error_message: row.get("error_message"),
                error_type: row.get("error_type"),
            })
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct JobAttempt {
    pub attempt_number: u32,
    pub attempted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_millis: Option<u64>,
    pub status: String,
    pub response_code: Option<u16>,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
    pub error_type: Option<String>,
}
