use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;

use crate::app_state::AppState;
use crate::db::store::{ResultOp, ResultOpOutput};
use crate::models::api::{CancelQuery, JobStatusResponse, ResultsQuery, TransitionResponse};
use crate::models::label::LabelResult;
use crate::routes::ApiError;

const DEFAULT_SCAN_LIMIT: i64 = 100;
const MAX_SCAN_LIMIT: i64 = 1_000;

/// GET /api/v1/jobs/{key} — job record plus its result row, if any.
pub async fn get_job(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job = state
        .call_retry
        .run("get_job", || state.jobs.get(&key))
        .await?
        .ok_or_else(|| ApiError::not_found(format!("job {key} not found")))?;

    let result = state
        .call_retry
        .run("get_result", || state.results.get(&job.bucket, &job.object_key))
        .await?
        .filter(|row| row.idempotency_key == job.idempotency_key);

    Ok(Json(JobStatusResponse { job, result }))
}

/// POST /api/v1/jobs/{key}/cancel — operator cancel of a PENDING or RUNNING job.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<CancelQuery>,
) -> Result<(StatusCode, Json<TransitionResponse>), ApiError> {
    let reason = query
        .reason
        .unwrap_or_else(|| "cancelled by operator".to_string());
    let changed = state
        .call_retry
        .run("cancel_job", || state.jobs.cancel(&key, &reason))
        .await?;
    if changed {
        tracing::info!(job_key = %key, reason = %reason, "Job cancelled");
    }
    transition_response(&state, key, changed).await
}

/// POST /api/v1/jobs/{key}/archive — archive a DONE or FAILED job.
pub async fn archive_job(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<(StatusCode, Json<TransitionResponse>), ApiError> {
    let changed = state
        .call_retry
        .run("archive_job", || state.jobs.archive(&key))
        .await?;
    transition_response(&state, key, changed).await
}

async fn transition_response(
    state: &AppState,
    key: String,
    changed: bool,
) -> Result<(StatusCode, Json<TransitionResponse>), ApiError> {
    let job = state
        .call_retry
        .run("get_job", || state.jobs.get(&key))
        .await?
        .ok_or_else(|| ApiError::not_found(format!("job {key} not found")))?;

    let status = if changed {
        StatusCode::OK
    } else {
        StatusCode::CONFLICT
    };
    Ok((
        status,
        Json(TransitionResponse {
            idempotency_key: key,
            changed,
            status: job.status,
        }),
    ))
}

/// GET /api/v1/results — one row by `bucket` + `object_key`, or a scan.
pub async fn get_results(
    State(state): State<AppState>,
    Query(query): Query<ResultsQuery>,
) -> Result<Json<Vec<LabelResult>>, ApiError> {
    let op = match (query.bucket, query.object_key) {
        (Some(bucket), Some(object_key)) => ResultOp::Get { bucket, object_key },
        (bucket, _) => ResultOp::Scan {
            bucket,
            limit: query
                .limit
                .unwrap_or(DEFAULT_SCAN_LIMIT)
                .clamp(1, MAX_SCAN_LIMIT),
        },
    };

    tracing::debug!(op = op.name(), "Reading result table");
    let output = state
        .call_retry
        .run(op.name(), || op.execute(state.results.as_ref()))
        .await?;

    let rows = match output {
        ResultOpOutput::Row(row) => row.into_iter().collect(),
        ResultOpOutput::Rows(rows) => rows,
        ResultOpOutput::Put(_) | ResultOpOutput::Deleted(_) => {
            return Err(ApiError::internal(format!(
                "read returned a write outcome for {}",
                op.name()
            )))
        }
    };
    Ok(Json(rows))
}
