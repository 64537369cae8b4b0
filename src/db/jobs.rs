use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::db::store::{ClaimOutcome, InsertOutcome, JobStore, StoreError};
use crate::models::job::{Job, JobStatus};

const JOB_COLUMNS: &str = "idempotency_key, bucket, object_key, object_version, event_time, \
     status, attempts, owner, last_error, created_at, updated_at, archived_at";

/// Job record store backed by the `label_jobs` table.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let status: String = row.try_get("status")?;
    let status = JobStatus::from_str(&status)
        .map_err(|_| StoreError::Corrupt(format!("unknown job status {status:?}")))?;

    Ok(Job {
        idempotency_key: row.try_get("idempotency_key")?,
        bucket: row.try_get("bucket")?,
        object_key: row.try_get("object_key")?,
        object_version: row.try_get("object_version")?,
        event_time: row.try_get("event_time")?,
        status,
        attempts: row.try_get("attempts")?,
        owner: row.try_get("owner")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        archived_at: row.try_get("archived_at")?,
    })
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert_if_absent(&self, job: &Job) -> Result<InsertOutcome, StoreError> {
        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO label_jobs (idempotency_key, bucket, object_key, object_version, event_time, status)
            VALUES ($1, $2, $3, $4, $5, 'pending')
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(&job.idempotency_key)
        .bind(&job.bucket)
        .bind(&job.object_key)
        .bind(&job.object_version)
        .bind(job.event_time)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(InsertOutcome::Created(job_from_row(&row)?));
        }

        // Lost the race, or a retry of an insert that already landed
        match self.get(&job.idempotency_key).await? {
            Some(existing) => Ok(InsertOutcome::Existing(existing)),
            None => Err(StoreError::Corrupt(format!(
                "job {} conflicted on insert but cannot be read",
                job.idempotency_key
            ))),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM label_jobs WHERE idempotency_key = $1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn resubmit(&self, key: &str) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE label_jobs
            SET status = 'pending',
                attempts = 0,
                owner = NULL,
                last_error = NULL,
                archived_at = NULL,
                updated_at = NOW()
            WHERE idempotency_key = $1 AND status = 'failed'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn claim(&self, key: &str, worker: Uuid) -> Result<ClaimOutcome, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE label_jobs
            SET status = 'running',
                attempts = attempts + 1,
                owner = $2,
                updated_at = NOW()
            WHERE idempotency_key = $1 AND status = 'pending'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(key)
        .bind(worker)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(ClaimOutcome::Claimed(job_from_row(&row)?));
        }

        Ok(match self.get(key).await? {
            Some(job) => ClaimOutcome::Conflict(job.status),
            None => ClaimOutcome::Missing,
        })
    }

    async fn release(&self, key: &str, worker: Uuid, error: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE label_jobs
            SET status = 'pending', owner = NULL, last_error = $3, updated_at = NOW()
            WHERE idempotency_key = $1 AND status = 'running' AND owner = $2
            "#,
        )
        .bind(key)
        .bind(worker)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn complete(&self, key: &str, worker: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE label_jobs
            SET status = 'done', last_error = NULL, updated_at = NOW()
            WHERE idempotency_key = $1 AND status = 'running' AND owner = $2
            "#,
        )
        .bind(key)
        .bind(worker)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn fail(&self, key: &str, worker: Uuid, error: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE label_jobs
            SET status = 'failed', last_error = $3, updated_at = NOW()
            WHERE idempotency_key = $1 AND status = 'running' AND owner = $2
            "#,
        )
        .bind(key)
        .bind(worker)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn fail_pending(&self, key: &str, error: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE label_jobs
            SET status = 'failed', last_error = $2, updated_at = NOW()
            WHERE idempotency_key = $1 AND status = 'pending'
            "#,
        )
        .bind(key)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn cancel(&self, key: &str, reason: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE label_jobs
            SET status = 'failed', last_error = $2, updated_at = NOW()
            WHERE idempotency_key = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(key)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn archive(&self, key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE label_jobs
            SET archived_at = NOW()
            WHERE idempotency_key = $1
              AND status IN ('done', 'failed')
              AND archived_at IS NULL
            "#,
        )
        .bind(key)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn touch_pending(&self, key: &str, seen: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE label_jobs
            SET updated_at = NOW()
            WHERE idempotency_key = $1 AND status = 'pending' AND updated_at = $2
            "#,
        )
        .bind(key)
        .bind(seen)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_stale(
        &self,
        status: JobStatus,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM label_jobs
            WHERE status = $1 AND updated_at < $2 AND archived_at IS NULL
            ORDER BY updated_at ASC
            LIMIT $3
            "#
        ))
        .bind(status.as_ref())
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
