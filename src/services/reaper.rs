use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use crate::db::store::{JobStore, StoreError};
use crate::models::job::{Job, JobStatus};
use crate::services::queue::{JobQueue, QueueError};
use crate::services::retry::RetryPolicy;

/// Configuration for the stale job reaper.
#[derive(Debug, Clone, Copy)]
pub struct ReaperConfig {
    /// RUNNING jobs untouched for this long have lost their worker.
    pub running_lease: Duration,
    /// PENDING jobs untouched for this long are assumed missing from the queue.
    pub pending_max_age: Duration,
    /// Jobs examined per status, and in-flight deliveries examined, per sweep.
    pub batch_limit: i64,
    /// Same bound the workers use.
    pub max_attempts: i32,
    pub store_retry: RetryPolicy,
    pub queue_retry: RetryPolicy,
}

/// Report of reaper execution results.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReaperReport {
    /// Jobs that were put back on the queue
    pub requeued: Vec<String>,
    /// Jobs that were marked as failed
    pub failed: Vec<String>,
    /// Jobs another process changed before this sweep could act
    pub skipped: usize,
    /// Unacknowledged deliveries dropped because their job had finished
    pub trimmed: usize,
}

impl ReaperReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty() && self.skipped == 0 && self.trimmed == 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReaperError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// One sweep over stale RUNNING and PENDING jobs, then over deliveries left
/// unacknowledged by workers that died.
pub async fn reap_stale_jobs(
    jobs: &dyn JobStore,
    queue: &dyn JobQueue,
    config: &ReaperConfig,
) -> Result<ReaperReport, ReaperError> {
    let mut report = ReaperReport::default();

    let lease_cutoff = Utc::now() - chrono::Duration::from_std(config.running_lease).unwrap_or_default();
    let running = config
        .store_retry
        .run("list_stale_running", || {
            jobs.list_stale(JobStatus::Running, lease_cutoff, config.batch_limit)
        })
        .await?;
    for job in running {
        reap_running(jobs, queue, config, &job, &mut report).await?;
    }

    let pending_cutoff =
        Utc::now() - chrono::Duration::from_std(config.pending_max_age).unwrap_or_default();
    let pending = config
        .store_retry
        .run("list_stale_pending", || {
            jobs.list_stale(JobStatus::Pending, pending_cutoff, config.batch_limit)
        })
        .await?;
    for job in pending {
        let key = job.idempotency_key.as_str();
        let touched = config
            .store_retry
            .run("touch_pending", || jobs.touch_pending(key, job.updated_at))
            .await?;
        if !touched {
            report.skipped += 1;
            continue;
        }
        requeue(queue, config, &job, &mut report).await?;
    }

    trim_unacked(jobs, queue, config, &mut report).await?;

    Ok(report)
}

/// Ack in-flight deliveries whose job is gone or no longer PENDING or
/// RUNNING. Deliveries of live jobs stay put, so a worker that is merely
/// slow keeps its entry.
async fn trim_unacked(
    jobs: &dyn JobStore,
    queue: &dyn JobQueue,
    config: &ReaperConfig,
    report: &mut ReaperReport,
) -> Result<(), ReaperError> {
    let limit = usize::try_from(config.batch_limit).unwrap_or(0);
    let deliveries = config
        .queue_retry
        .run("list_unacked", || queue.unacked(limit))
        .await?;

    for delivery in deliveries {
        let key = delivery.message.idempotency_key.as_str();
        let job = config.store_retry.run("get_job", || jobs.get(key)).await?;
        let live = job.is_some_and(|j| matches!(j.status, JobStatus::Pending | JobStatus::Running));
        if live {
            continue;
        }

        config
            .queue_retry
            .run("ack_orphaned_delivery", || queue.ack(&delivery))
            .await?;
        tracing::debug!(job_key = %key, "Dropped orphaned delivery");
        report.trimmed += 1;
    }
    Ok(())
}

async fn reap_running(
    jobs: &dyn JobStore,
    queue: &dyn JobQueue,
    config: &ReaperConfig,
    job: &Job,
    report: &mut ReaperReport,
) -> Result<(), ReaperError> {
    let Some(owner) = job.owner else {
        report.skipped += 1;
        return Ok(());
    };
    let key = job.idempotency_key.as_str();

    if job.attempts >= config.max_attempts {
        let reason = format!(
            "lease expired on final attempt ({} of {})",
            job.attempts, config.max_attempts
        );
        let failed = config
            .store_retry
            .run("fail_stale_job", || jobs.fail(key, owner, &reason))
            .await?;
        if failed {
            tracing::warn!(job_key = %key, worker_id = %owner, "Stale job failed");
            report.failed.push(job.idempotency_key.clone());
        } else {
            report.skipped += 1;
        }
        return Ok(());
    }

    let released = config
        .store_retry
        .run("release_stale_job", || jobs.release(key, owner, "lease expired"))
        .await?;
    if !released {
        report.skipped += 1;
        return Ok(());
    }

    tracing::warn!(job_key = %key, worker_id = %owner, "Lease expired, job released");
    requeue(queue, config, job, report).await
}

async fn requeue(
    queue: &dyn JobQueue,
    config: &ReaperConfig,
    job: &Job,
    report: &mut ReaperReport,
) -> Result<(), ReaperError> {
    let message = job.message();
    config
        .queue_retry
        .run("requeue_stale_job", || queue.enqueue(&message))
        .await?;
    report.requeued.push(job.idempotency_key.clone());
    Ok(())
}
