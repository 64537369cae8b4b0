use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::models::event::UploadEvent;

/// Lifecycle state of a labeling job in the job record store.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    /// Transitions the job record store accepts.
    ///
    /// `Failed -> Pending` is the dispatcher's resubmission path; workers
    /// never leave `Failed`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Pending)
                | (Running, Done)
                | (Running, Failed)
                | (Failed, Pending)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

/// A labeling job, keyed by its idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub idempotency_key: String,
    pub bucket: String,
    pub object_key: String,
    pub object_version: Option<String>,
    pub event_time: DateTime<Utc>,
    pub status: JobStatus,
    pub attempts: i32,
    /// Worker holding the RUNNING claim.
    pub owner: Option<Uuid>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl Job {
    /// New PENDING job for an upload whose version has been resolved.
    pub fn new(idempotency_key: String, event: &UploadEvent, object_version: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            idempotency_key,
            bucket: event.bucket.clone(),
            object_key: event.object_key.clone(),
            object_version,
            event_time: event.event_time,
            status: JobStatus::Pending,
            attempts: 0,
            owner: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            archived_at: None,
        }
    }

    pub fn is_owned_by(&self, worker_id: Uuid) -> bool {
        self.status == JobStatus::Running && self.owner == Some(worker_id)
    }

    pub fn message(&self) -> JobMessage {
        JobMessage {
            idempotency_key: self.idempotency_key.clone(),
            bucket: self.bucket.clone(),
            object_key: self.object_key.clone(),
        }
    }
}

/// Queue payload. The job record store stays the source of truth; the
/// message only points at it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    pub idempotency_key: String,
    pub bucket: String,
    pub object_key: String,
}

/// What the dispatcher hands back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobHandle {
    pub idempotency_key: String,
    pub bucket: String,
    pub object_key: String,
    pub status: JobStatus,
    pub attempts: i32,
    /// True when the submission was absorbed by an existing job.
    pub duplicate: bool,
}

impl JobHandle {
    pub fn created(job: &Job) -> Self {
        Self::from_job(job, false)
    }

    pub fn existing(job: &Job) -> Self {
        Self::from_job(job, true)
    }

    fn from_job(job: &Job, duplicate: bool) -> Self {
        Self {
            idempotency_key: job.idempotency_key.clone(),
            bucket: job.bucket.clone(),
            object_key: job.object_key.clone(),
            status: job.status,
            attempts: job.attempts,
            duplicate,
        }
    }
}
