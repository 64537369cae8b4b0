use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;

use crate::app_state::AppState;
use crate::error::ErrorKind;
use crate::models::api::RecordResponse;
use crate::models::event::{S3Notification, UploadEvent};
use crate::models::job::JobHandle;
use crate::routes::ApiError;
use crate::services::dispatcher::RecordOutcome;

/// POST /api/v1/jobs — submit a single upload.
///
/// 202 for a new job, 200 when the upload was already submitted.
pub async fn submit_event(
    State(state): State<AppState>,
    Json(event): Json<UploadEvent>,
) -> Result<(StatusCode, Json<JobHandle>), ApiError> {
    let handle = state.dispatcher.submit(event).await?;
    let status = if handle.duplicate {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(handle)))
}

/// POST /api/v1/events — storage notification with one or more records.
///
/// Answers 503 when any record failed transiently so the sender redelivers
/// the batch; records that already went through are absorbed as duplicates.
pub async fn submit_notification(
    State(state): State<AppState>,
    Json(notification): Json<S3Notification>,
) -> (StatusCode, Json<Vec<RecordResponse>>) {
    let outcomes = state.dispatcher.submit_notification(notification).await;

    let mut retry_batch = false;
    let records = outcomes
        .into_iter()
        .map(|outcome| match outcome {
            RecordOutcome::Submitted(job) => RecordResponse::Submitted { job },
            RecordOutcome::Skipped { event_name } => RecordResponse::Skipped { event_name },
            RecordOutcome::Rejected(e) => {
                let kind = e.kind();
                retry_batch |= kind == ErrorKind::TransientInfra;
                tracing::warn!(error = %e, kind = %kind, "Notification record rejected");
                RecordResponse::Rejected {
                    kind,
                    error: e.to_string(),
                }
            }
        })
        .collect();

    let status = if retry_batch {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::ACCEPTED
    };
    (status, Json(records))
}
