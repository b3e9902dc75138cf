//! PostgreSQL implementation of [`JobStore`].
//!
//! State transitions are applied by [`JobRecord`] inside a transaction that holds a row lock,
//! so the in-memory and Postgres stores share one state machine. Claims additionally take a
//! per-queue advisory lock so the active-count check and the claim happen atomically across
//! processes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::Database;
use crate::error::{ConveyorError, Result};
use crate::jobs::job::chrono_duration;
use crate::jobs::{JobCounts, JobError, JobId, JobRecord, JobStatus, JobStore, RemoveOutcome};

const JOB_COLUMNS: &str = "id, queue, payload, status, attempts_made, max_attempts, backoff, \
     keep_completed, keep_failed, stalled_count, recurring_id, created_at, next_eligible_at, \
     started_at, finished_at, last_error, lease_owner, lease_expires_at";

/// Job store backed by the `jobs` table.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    db: Database,
}

impl PostgresJobStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn ensure_open(&self) -> Result<()> {
        if self.db.is_closed() {
            return Err(ConveyorError::store_closed());
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn insert(&self, job: &JobRecord) -> Result<bool> {
        self.ensure_open()?;
        // A conflict on the partial recurring index means a live duplicate exists.
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (
                id, queue, payload, status, attempts_made, max_attempts, backoff,
                keep_completed, keep_failed, stalled_count, recurring_id, created_at,
                next_eligible_at, started_at, finished_at, last_error, lease_owner,
                lease_expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(&job.queue)
        .bind(&job.payload)
        .bind(job.status.as_str())
        .bind(to_db(job.attempts_made))
        .bind(to_db(job.max_attempts))
        .bind(serde_json::to_value(&job.backoff)?)
        .bind(to_db(job.keep_completed))
        .bind(to_db(job.keep_failed))
        .bind(to_db(job.stalled_count))
        .bind(job.recurring_id.as_deref())
        .bind(job.created_at)
        .bind(job.next_eligible_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(job.last_error.as_deref())
        .bind(job.lease_owner.as_deref())
        .bind(job.lease_expires_at)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn claim(
        &self,
        queue: &str,
        limit: usize,
        owner: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>> {
        self.ensure_open()?;
        let mut tx = self.db.pool().begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(queue)
            .execute(&mut *tx)
            .await?;

        let active: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE queue = $1 AND status = 'active'")
                .bind(queue)
                .fetch_one(&mut *tx)
                .await?;
        if active >= i64::try_from(limit).unwrap_or(i64::MAX) {
            return Ok(None);
        }

        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE queue = $1
              AND (status = 'waiting' OR (status = 'delayed' AND next_eligible_at <= $2))
            ORDER BY next_eligible_at, seq
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(queue)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut job = JobRecord::try_from(row)?;
        job.activate(owner, now + chrono_duration(lease), now)?;
        write_job(&mut tx, &job).await?;
        tx.commit().await?;

        debug!(queue, job_id = %job.id, owner, "Job claimed");
        Ok(Some(job))
    }

    async fn heartbeat(
        &self,
        id: JobId,
        owner: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.ensure_open()?;
        let result = sqlx::query(
            r#"
            UPDATE jobs SET lease_expires_at = $3
            WHERE id = $1 AND status = 'active' AND lease_owner = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(owner)
        .bind(now + chrono_duration(lease))
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn complete(
        &self,
        id: JobId,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>> {
        self.ensure_open()?;
        let mut tx = self.db.pool().begin().await?;
        let Some(mut job) = fetch_locked(&mut tx, id).await? else {
            return Ok(None);
        };
        if !job.is_owned_by(owner) {
            return Ok(None);
        }
        job.record_success(now)?;
        write_job(&mut tx, &job).await?;
        tx.commit().await?;
        Ok(Some(job))
    }

    async fn fail(
        &self,
        id: JobId,
        owner: &str,
        error: &JobError,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>> {
        self.ensure_open()?;
        let mut tx = self.db.pool().begin().await?;
        let Some(mut job) = fetch_locked(&mut tx, id).await? else {
            return Ok(None);
        };
        if !job.is_owned_by(owner) {
            return Ok(None);
        }
        job.record_failure(error, now)?;
        write_job(&mut tx, &job).await?;
        tx.commit().await?;
        Ok(Some(job))
    }

    async fn recover_stalled(
        &self,
        queue: &str,
        max_stalled: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>> {
        self.ensure_open()?;
        let mut tx = self.db.pool().begin().await?;

        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE queue = $1
              AND status = 'active'
              AND (lease_expires_at IS NULL OR lease_expires_at <= $2)
            FOR UPDATE SKIP LOCKED
            "#
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(queue)
            .bind(now)
            .fetch_all(&mut *tx)
            .await?;

        let mut recovered = Vec::with_capacity(rows.len());
        for row in rows {
            let mut job = JobRecord::try_from(row)?;
            job.recover_stall(max_stalled, now)?;
            write_job(&mut tx, &job).await?;
            recovered.push(job);
        }
        tx.commit().await?;
        Ok(recovered)
    }

    async fn trim(&self, queue: &str, status: JobStatus, keep: u32) -> Result<u64> {
        self.ensure_open()?;
        if !status.is_terminal() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            DELETE FROM jobs WHERE id IN (
                SELECT id FROM jobs
                WHERE queue = $1 AND status = $2
                ORDER BY finished_at DESC NULLS LAST, seq DESC
                OFFSET $3
            )
            "#,
        )
        .bind(queue)
        .bind(status.as_str())
        .bind(i64::from(keep))
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected())
    }

    async fn remove(&self, id: JobId) -> Result<RemoveOutcome> {
        self.ensure_open()?;
        let deleted: Option<Uuid> = sqlx::query_scalar(
            "DELETE FROM jobs WHERE id = $1 AND status IN ('waiting', 'delayed') RETURNING id",
        )
        .bind(id.as_uuid())
        .fetch_optional(self.db.pool())
        .await?;
        if deleted.is_some() {
            return Ok(RemoveOutcome::Removed);
        }

        let status: Option<String> = sqlx::query_scalar("SELECT status FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(self.db.pool())
            .await?;
        match status {
            Some(status) => Ok(RemoveOutcome::NotRemovable(status.parse()?)),
            None => Ok(RemoveOutcome::NotFound),
        }
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>> {
        self.ensure_open()?;
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id.as_uuid())
            .fetch_optional(self.db.pool())
            .await?;
        row.map(JobRecord::try_from).transpose()
    }

    async fn list(
        &self,
        queue: &str,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<JobRecord>> {
        self.ensure_open()?;
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE queue = $1 AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC, seq DESC
            LIMIT $3
            "#
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(queue)
            .bind(status.map(|s| s.as_str()))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(self.db.pool())
            .await?;
        rows.into_iter().map(JobRecord::try_from).collect()
    }

    async fn counts(&self, queue: &str) -> Result<JobCounts> {
        self.ensure_open()?;
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs WHERE queue = $1 GROUP BY status")
                .bind(queue)
                .fetch_all(self.db.pool())
                .await?;

        let mut counts = JobCounts::default();
        for (status, n) in rows {
            counts.add(status.parse()?, u64::try_from(n).unwrap_or(0));
        }
        Ok(counts)
    }

    async fn ping(&self) -> Result<()> {
        self.ensure_open()?;
        self.db.check_connectivity().await.map(|_| ())
    }

    async fn close(&self) {
        self.db.close().await;
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

async fn fetch_locked(conn: &mut PgConnection, id: JobId) -> Result<Option<JobRecord>> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE");
    let row = sqlx::query_as::<_, JobRow>(&sql)
        .bind(id.as_uuid())
        .fetch_optional(conn)
        .await?;
    row.map(JobRecord::try_from).transpose()
}

/// Persist the mutable columns of `job`.
async fn write_job(conn: &mut PgConnection, job: &JobRecord) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE jobs SET
            status = $2,
            attempts_made = $3,
            stalled_count = $4,
            next_eligible_at = $5,
            started_at = $6,
            finished_at = $7,
            last_error = $8,
            lease_owner = $9,
            lease_expires_at = $10
        WHERE id = $1
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(job.status.as_str())
    .bind(to_db(job.attempts_made))
    .bind(to_db(job.stalled_count))
    .bind(job.next_eligible_at)
    .bind(job.started_at)
    .bind(job.finished_at)
    .bind(job.last_error.as_deref())
    .bind(job.lease_owner.as_deref())
    .bind(job.lease_expires_at)
    .execute(conn)
    .await?;
    Ok(())
}

fn to_db(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn from_db(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Row Types
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct JobRow {
    pub id: Uuid,
    pub queue: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts_made: i32,
    pub max_attempts: i32,
    pub backoff: serde_json::Value,
    pub keep_completed: i32,
    pub keep_failed: i32,
    pub stalled_count: i32,
    pub recurring_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub next_eligible_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = ConveyorError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Self {
            id: JobId::from(row.id),
            queue: row.queue,
            payload: row.payload,
            status: row.status.parse()?,
            attempts_made: from_db(row.attempts_made),
            max_attempts: from_db(row.max_attempts),
            backoff: serde_json::from_value(row.backoff)?,
            keep_completed: from_db(row.keep_completed),
            keep_failed: from_db(row.keep_failed),
            stalled_count: from_db(row.stalled_count),
            recurring_id: row.recurring_id,
            created_at: row.created_at,
            next_eligible_at: row.next_eligible_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            last_error: row.last_error,
            lease_owner: row.lease_owner,
            lease_expires_at: row.lease_expires_at,
        })
    }
}
