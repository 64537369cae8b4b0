//! Storage seams for the pipeline.
//!
//! Both stores only mutate through compare-and-set or conditional puts, so
//! any number of dispatchers and workers can share them without locks.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::job::{Job, JobStatus};
use crate::models::label::LabelResult;
use crate::services::retry::Retryable;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        match self {
            StoreError::Database(e) => match e {
                sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
                | sqlx::Error::Protocol(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::WorkerCrashed => true,
                // serialization_failure, deadlock_detected, admin_shutdown
                sqlx::Error::Database(db) => {
                    matches!(db.code().as_deref(), Some("40001" | "40P01" | "57P01"))
                }
                _ => false,
            },
            StoreError::Timeout(_) => true,
            StoreError::Corrupt(_) => false,
        }
    }

    fn timed_out(after: Duration) -> Self {
        StoreError::Timeout(after)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Created(Job),
    Existing(Job),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// PENDING -> RUNNING succeeded; attempts already incremented.
    Claimed(Job),
    /// Someone else got there first, or the job is not claimable.
    Conflict(JobStatus),
    Missing,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PutOutcome {
    Written(LabelResult),
    /// A row from a newer object version is already in place.
    Superseded { current: LabelResult },
}

/// Durable job state keyed by idempotency key.
///
/// Transitions returning `bool` are compare-and-set: `false` means the
/// precondition did not hold and nothing changed.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_if_absent(&self, job: &Job) -> Result<InsertOutcome, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<Job>, StoreError>;

    /// FAILED -> PENDING with attempts reset. `None` if the job was not FAILED.
    async fn resubmit(&self, key: &str) -> Result<Option<Job>, StoreError>;

    /// PENDING -> RUNNING owned by `worker`, incrementing attempts.
    async fn claim(&self, key: &str, worker: Uuid) -> Result<ClaimOutcome, StoreError>;

    /// RUNNING(owned by `worker`) -> PENDING, for a retry.
    async fn release(&self, key: &str, worker: Uuid, error: &str) -> Result<bool, StoreError>;

    /// RUNNING(owned by `worker`) -> DONE.
    async fn complete(&self, key: &str, worker: Uuid) -> Result<bool, StoreError>;

    /// RUNNING(owned by `worker`) -> FAILED.
    async fn fail(&self, key: &str, worker: Uuid, error: &str) -> Result<bool, StoreError>;

    /// PENDING -> FAILED, used when dispatch gives up.
    async fn fail_pending(&self, key: &str, error: &str) -> Result<bool, StoreError>;

    /// Operator cancel: PENDING or RUNNING -> FAILED regardless of owner.
    async fn cancel(&self, key: &str, reason: &str) -> Result<bool, StoreError>;

    /// Mark a DONE or FAILED job as archived.
    async fn archive(&self, key: &str) -> Result<bool, StoreError>;

    /// Bump `updated_at` of a PENDING job, provided nobody touched it since
    /// `seen`. Lets concurrent reapers agree on who re-enqueues.
    async fn touch_pending(&self, key: &str, seen: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Unarchived jobs in `status` not updated since `older_than`, oldest first.
    async fn list_stale(
        &self,
        status: JobStatus,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Job>, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

/// Result rows keyed by `(bucket, object_key)`.
#[async_trait]
pub trait ResultTable: Send + Sync {
    /// Write `result` unless the current row wins under
    /// [`LabelResult::supersedes`].
    async fn put_conditional(&self, result: &LabelResult) -> Result<PutOutcome, StoreError>;

    async fn get(&self, bucket: &str, object_key: &str) -> Result<Option<LabelResult>, StoreError>;

    async fn delete(&self, bucket: &str, object_key: &str) -> Result<bool, StoreError>;

    /// Rows ordered by `(bucket, object_key)`, optionally for one bucket.
    async fn scan(&self, bucket: Option<&str>, limit: i64) -> Result<Vec<LabelResult>, StoreError>;
}

/// Operations on the result table.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultOp {
    Get { bucket: String, object_key: String },
    Put(LabelResult),
    Delete { bucket: String, object_key: String },
    Scan { bucket: Option<String>, limit: i64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResultOpOutput {
    Row(Option<LabelResult>),
    Put(PutOutcome),
    Deleted(bool),
    Rows(Vec<LabelResult>),
}

impl ResultOp {
    pub fn name(&self) -> &'static str {
        match self {
            ResultOp::Get { .. } => "get",
            ResultOp::Put(_) => "put",
            ResultOp::Delete { .. } => "delete",
            ResultOp::Scan { .. } => "scan",
        }
    }

    /// Borrows `self` so a retry policy can run the same operation again.
    pub async fn execute(&self, table: &dyn ResultTable) -> Result<ResultOpOutput, StoreError> {
        let output = match self {
            ResultOp::Get { bucket, object_key } => {
                ResultOpOutput::Row(table.get(bucket, object_key).await?)
            }
            ResultOp::Put(result) => ResultOpOutput::Put(table.put_conditional(result).await?),
            ResultOp::Delete { bucket, object_key } => {
                ResultOpOutput::Deleted(table.delete(bucket, object_key).await?)
            }
            ResultOp::Scan { bucket, limit } => {
                ResultOpOutput::Rows(table.scan(bucket.as_deref(), *limit).await?)
            }
        };
        Ok(output)
    }
}
