use std::sync::Arc;

use garde::Validate;

use crate::db::store::{InsertOutcome, JobStore, StoreError};
use crate::error::ErrorKind;
use crate::models::event::{idempotency_key, S3Notification, UploadEvent};
use crate::models::job::{Job, JobHandle, JobStatus};
use crate::services::queue::{JobQueue, QueueError};
use crate::services::retry::{Retryable, RetryPolicy};
use crate::services::storage::{ObjectStore, StorageError};

#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    /// Job record store calls.
    pub store_retry: RetryPolicy,
    /// Queue submission. Exhaustion fails the job.
    pub enqueue_retry: RetryPolicy,
    /// Object version lookups.
    pub storage_retry: RetryPolicy,
}

/// Turns upload events into exactly one queued job per idempotency key.
pub struct Dispatcher {
    jobs: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    objects: Option<Arc<dyn ObjectStore>>,
    config: DispatcherConfig,
}

/// Outcome of one record of a storage notification.
#[derive(Debug)]
pub enum RecordOutcome {
    Submitted(JobHandle),
    Skipped { event_name: String },
    Rejected(DispatchError),
}

impl Dispatcher {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        objects: Option<Arc<dyn ObjectStore>>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            jobs,
            queue,
            objects,
            config,
        }
    }

    /// Submit one upload. Repeated submissions of the same upload return the
    /// existing job's handle instead of queueing it again.
    #[tracing::instrument(skip(self, event), fields(bucket = %event.bucket, object_key = %event.object_key))]
    pub async fn submit(&self, event: UploadEvent) -> Result<JobHandle, DispatchError> {
        event
            .validate()
            .map_err(|report| DispatchError::InvalidEvent(report.to_string()))?;

        let version = self.resolve_version(&event).await?;
        let key = idempotency_key(&event.bucket, &event.object_key, version.as_deref());
        let candidate = Job::new(key.clone(), &event, version);

        let mut insert_calls = 0u32;
        let outcome = self
            .config
            .store_retry
            .run("insert_job", || {
                insert_calls += 1;
                self.jobs.insert_if_absent(&candidate)
            })
            .await?;

        let job = match outcome {
            InsertOutcome::Created(job) => job,
            // An earlier attempt may have written the row before it timed
            // out. Nobody has claimed it, so queueing it again is harmless.
            InsertOutcome::Existing(existing)
                if insert_calls > 1
                    && existing.status == JobStatus::Pending
                    && existing.attempts == 0 =>
            {
                tracing::info!(job_key = %key, "Insert retried after a lost reply, dispatching job");
                existing
            }
            InsertOutcome::Existing(existing) if existing.status != JobStatus::Failed => {
                tracing::info!(job_key = %key, status = %existing.status, "Duplicate submission absorbed");
                metrics::counter!("pipeline_jobs_duplicate_total").increment(1);
                return Ok(JobHandle::existing(&existing));
            }
            InsertOutcome::Existing(_) => {
                let resubmitted = self
                    .config
                    .store_retry
                    .run("resubmit_job", || self.jobs.resubmit(&key))
                    .await?;
                match resubmitted {
                    Some(job) => {
                        tracing::info!(job_key = %key, "Resubmitting failed job");
                        job
                    }
                    None => {
                        // Another dispatcher reset it first
                        let current = self
                            .config
                            .store_retry
                            .run("get_job", || self.jobs.get(&key))
                            .await?
                            .ok_or_else(|| {
                                DispatchError::Store(StoreError::Corrupt(format!(
                                    "job {key} vanished during resubmission"
                                )))
                            })?;
                        metrics::counter!("pipeline_jobs_duplicate_total").increment(1);
                        return Ok(JobHandle::existing(&current));
                    }
                }
            }
        };

        let message = job.message();
        if let Err(e) = self
            .config
            .enqueue_retry
            .run("enqueue_job", || self.queue.enqueue(&message))
            .await
        {
            tracing::error!(job_key = %key, error = %e, "Queue submission failed, marking job failed");
            metrics::counter!("pipeline_dispatch_failed_total").increment(1);

            let reason = format!("dispatch failed: {e}");
            if let Err(store_err) = self
                .config
                .store_retry
                .run("fail_job", || self.jobs.fail_pending(&key, &reason))
                .await
            {
                // The reaper re-enqueues PENDING jobs that never reached the queue
                tracing::warn!(job_key = %key, error = %store_err, "Could not mark undispatched job failed");
            }
            return Err(DispatchError::Enqueue { key, source: e });
        }

        tracing::info!(job_key = %key, "Job submitted");
        metrics::counter!("pipeline_jobs_submitted_total").increment(1);
        Ok(JobHandle::created(&job))
    }

    /// Submit every object-created record of a storage notification.
    pub async fn submit_notification(&self, notification: S3Notification) -> Vec<RecordOutcome> {
        let mut outcomes = Vec::with_capacity(notification.records.len());
        for record in notification.records {
            if !record.is_object_created() {
                let event_name = record.event_name.unwrap_or_default();
                tracing::debug!(event_name = %event_name, "Ignoring non-creation record");
                outcomes.push(RecordOutcome::Skipped { event_name });
                continue;
            }

            let outcome = match record.to_upload_event() {
                Ok(event) => match self.submit(event).await {
                    Ok(handle) => RecordOutcome::Submitted(handle),
                    Err(e) => RecordOutcome::Rejected(e),
                },
                Err(e) => RecordOutcome::Rejected(DispatchError::InvalidKey(e.to_string())),
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn resolve_version(&self, event: &UploadEvent) -> Result<Option<String>, DispatchError> {
        if let Some(version) = event.version.clone().filter(|v| !v.is_empty()) {
            return Ok(Some(version));
        }
        let Some(objects) = &self.objects else {
            return Ok(None);
        };

        let head = self
            .config
            .storage_retry
            .run("head_object", || objects.head(&event.bucket, &event.object_key))
            .await?;

        match head {
            Some(version) => Ok(version.identity()),
            None => Err(DispatchError::ObjectNotFound {
                bucket: event.bucket.clone(),
                object_key: event.object_key.clone(),
            }),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Invalid upload event: {0}")]
    InvalidEvent(String),

    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    #[error("Object {bucket}/{object_key} does not exist")]
    ObjectNotFound { bucket: String, object_key: String },

    #[error("Object store error: {0}")]
    Storage(#[from] StorageError),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Could not enqueue job {key}: {source}")]
    Enqueue { key: String, source: QueueError },
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::InvalidEvent(_)
            | DispatchError::InvalidKey(_)
            | DispatchError::ObjectNotFound { .. } => ErrorKind::PermanentInput,
            DispatchError::Storage(e) if !e.is_retryable() => ErrorKind::PermanentInput,
            DispatchError::Storage(_) | DispatchError::Store(_) | DispatchError::Enqueue { .. } => {
                ErrorKind::TransientInfra
            }
        }
    }
}
