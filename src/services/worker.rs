use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::db::store::{ClaimOutcome, JobStore, PutOutcome, ResultTable, StoreError};
use crate::error::ErrorKind;
use crate::models::job::{Job, JobMessage, JobStatus};
use crate::models::label::{top_label, LabelResult};
use crate::services::classifier::Classifier;
use crate::services::queue::{JobQueue, QueueError};
use crate::services::retry::{Backoff, Retryable, RetryPolicy};

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    /// Claims allowed per job before it is failed for good.
    pub max_attempts: i32,
    pub store_retry: RetryPolicy,
    pub classifier_retry: RetryPolicy,
    pub queue_retry: RetryPolicy,
    /// Delay before a released job becomes visible again, by attempt.
    pub requeue_backoff: Backoff,
}

/// How a single delivery ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// Result written and job DONE.
    Completed(LabelResult),
    /// Job DONE, but a row from a newer object version was kept.
    Superseded { current: LabelResult },
    /// Transient failure; job back to PENDING and re-enqueued.
    Retrying { attempts: i32, delay: Duration },
    Failed { kind: ErrorKind, reason: String },
    /// Duplicate delivery: the job was not claimable. `None` if unknown.
    Skipped { status: Option<JobStatus> },
    /// The claim was lost (operator cancel or lease expiry) mid-flight.
    Aborted,
}

/// Processes one job at a time: claim, classify, write, complete.
pub struct Worker {
    id: Uuid,
    jobs: Arc<dyn JobStore>,
    results: Arc<dyn ResultTable>,
    queue: Arc<dyn JobQueue>,
    classifier: Arc<dyn Classifier>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        results: Arc<dyn ResultTable>,
        queue: Arc<dyn JobQueue>,
        classifier: Arc<dyn Classifier>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            jobs,
            results,
            queue,
            classifier,
            config,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Take one delivery off the queue and process it. `None` when the queue
    /// was empty.
    ///
    /// The delivery is acknowledged even when processing hit an
    /// infrastructure error: the job record still says where the job stands
    /// and the reaper re-enqueues anything left behind.
    pub async fn run_once(&self) -> Result<Option<ProcessOutcome>, WorkerError> {
        let Some(delivery) = self
            .config
            .queue_retry
            .run("dequeue", || self.queue.dequeue())
            .await?
        else {
            return Ok(None);
        };

        let outcome = self.process(&delivery.message).await;
        let acked = self
            .config
            .queue_retry
            .run("ack", || self.queue.ack(&delivery))
            .await;

        let outcome = outcome?;
        acked?;
        Ok(Some(outcome))
    }

    #[tracing::instrument(
        skip(self, message),
        fields(job_key = %message.idempotency_key, worker_id = %self.id)
    )]
    pub async fn process(&self, message: &JobMessage) -> Result<ProcessOutcome, WorkerError> {
        let key = message.idempotency_key.as_str();

        let claim = self
            .config
            .store_retry
            .run("claim_job", || self.jobs.claim(key, self.id))
            .await?;

        let job = match claim {
            ClaimOutcome::Claimed(job) => job,
            ClaimOutcome::Conflict(status) => {
                tracing::debug!(status = %status, "Job not claimable, dropping delivery");
                return Ok(ProcessOutcome::Skipped {
                    status: Some(status),
                });
            }
            ClaimOutcome::Missing => {
                tracing::warn!("Delivery for unknown job, dropping");
                return Ok(ProcessOutcome::Skipped { status: None });
            }
        };

        tracing::info!(
            bucket = %job.bucket,
            object_key = %job.object_key,
            attempts = job.attempts,
            "Processing labeling job"
        );

        if job.attempts > self.config.max_attempts {
            let reason = format!("attempt limit of {} exceeded", self.config.max_attempts);
            return self.fail(&job, ErrorKind::TransientInfra, reason).await;
        }

        let start = Instant::now();
        let labels = self
            .config
            .classifier_retry
            .run("detect_labels", || {
                self.classifier.detect_labels(&job.bucket, &job.object_key)
            })
            .await;
        metrics::histogram!("pipeline_classification_seconds").record(start.elapsed().as_secs_f64());

        let labels = match labels {
            Ok(labels) => labels,
            Err(e) if e.kind().is_retryable() => return self.retry_later(&job, &e.to_string()).await,
            Err(e) => return self.fail(&job, e.kind(), e.to_string()).await,
        };

        let label = match top_label(&labels) {
            Ok(label) => label.clone(),
            Err(e) => return self.fail(&job, e.kind(), e.to_string()).await,
        };

        tracing::info!(
            label = %label.name,
            confidence = label.confidence,
            label_count = labels.len(),
            classify_ms = start.elapsed().as_millis() as u64,
            "Classification complete"
        );

        // Operator cancels and lease expiry both show up as lost ownership
        let current = self
            .config
            .store_retry
            .run("get_job", || self.jobs.get(key))
            .await?;
        if !current.as_ref().is_some_and(|j| j.is_owned_by(self.id)) {
            tracing::info!(
                status = ?current.map(|j| j.status),
                "Job no longer owned, skipping result write"
            );
            return Ok(ProcessOutcome::Aborted);
        }

        let result = LabelResult::for_job(&job, &label);
        let put = match self
            .config
            .store_retry
            .run("put_result", || self.results.put_conditional(&result))
            .await
        {
            Ok(put) => put,
            Err(e) if e.is_retryable() => return self.retry_later(&job, &e.to_string()).await,
            Err(e) => return Err(e.into()),
        };

        let completed = self
            .config
            .store_retry
            .run("complete_job", || self.jobs.complete(key, self.id))
            .await?;
        if !completed {
            tracing::warn!("Result written but job ownership lost before completion");
            return Ok(ProcessOutcome::Aborted);
        }

        metrics::counter!("pipeline_jobs_completed_total").increment(1);
        match put {
            PutOutcome::Written(written) => {
                tracing::info!(label = %written.label_name, "Job completed");
                Ok(ProcessOutcome::Completed(written))
            }
            PutOutcome::Superseded { current } => {
                tracing::info!(
                    current_job = %current.idempotency_key,
                    "Newer result already recorded, kept it"
                );
                Ok(ProcessOutcome::Superseded { current })
            }
        }
    }

    /// Release the claim and re-enqueue with backoff, or fail the job once
    /// its attempts are used up.
    async fn retry_later(&self, job: &Job, reason: &str) -> Result<ProcessOutcome, WorkerError> {
        if job.attempts >= self.config.max_attempts {
            let reason = format!("giving up after {} attempts: {reason}", job.attempts);
            return self.fail(job, ErrorKind::TransientInfra, reason).await;
        }

        let key = job.idempotency_key.as_str();
        let released = self
            .config
            .store_retry
            .run("release_job", || self.jobs.release(key, self.id, reason))
            .await?;
        if !released {
            return Ok(ProcessOutcome::Aborted);
        }

        let delay = self
            .config
            .requeue_backoff
            .delay(u32::try_from(job.attempts - 1).unwrap_or(0));
        let message = job.message();
        if let Err(e) = self
            .config
            .queue_retry
            .run("requeue_job", || self.queue.enqueue_delayed(&message, delay))
            .await
        {
            // Job is PENDING, so the reaper's stale sweep re-enqueues it
            tracing::warn!(error = %e, "Could not re-enqueue released job");
        }

        tracing::info!(
            attempts = job.attempts,
            delay_ms = delay.as_millis() as u64,
            reason,
            "Job released for retry"
        );
        metrics::counter!("pipeline_jobs_retried_total").increment(1);

        Ok(ProcessOutcome::Retrying {
            attempts: job.attempts,
            delay,
        })
    }

    async fn fail(&self, job: &Job, kind: ErrorKind, reason: String) -> Result<ProcessOutcome, WorkerError> {
        let key = job.idempotency_key.as_str();
        let failed = self
            .config
            .store_retry
            .run("fail_job", || self.jobs.fail(key, self.id, &reason))
            .await?;
        if !failed {
            return Ok(ProcessOutcome::Aborted);
        }

        tracing::warn!(kind = %kind, reason = %reason, attempts = job.attempts, "Job failed");
        metrics::counter!("pipeline_jobs_failed_total", "kind" => kind.as_ref().to_string()).increment(1);

        Ok(ProcessOutcome::Failed { kind, reason })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}
