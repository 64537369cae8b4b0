use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::models::job::{Job, JobHandle, JobStatus};
use crate::models::label::LabelResult;

/// Response for querying a job.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job: Job,
    pub result: Option<LabelResult>,
}

/// Per-record outcome of a storage notification.
#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecordResponse {
    Submitted { job: JobHandle },
    Skipped { event_name: String },
    Rejected { kind: ErrorKind, error: String },
}

/// Query for operator cancellation.
#[derive(Debug, Default, Deserialize)]
pub struct CancelQuery {
    pub reason: Option<String>,
}

/// Result of an operator transition on a job.
#[derive(Debug, Serialize)]
pub struct TransitionResponse {
    pub idempotency_key: String,
    pub changed: bool,
    pub status: JobStatus,
}

#[derive(Debug, Deserialize)]
pub struct ResultsQuery {
    pub bucket: Option<String>,
    pub object_key: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}
