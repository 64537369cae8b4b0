use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::app_state::AppState;
use crate::db::store::StoreError;
use crate::error::ErrorKind;
use crate::models::api::ErrorResponse;
use crate::services::dispatcher::DispatchError;

pub mod events;
pub mod health;
pub mod jobs;
pub mod metrics;

/// Intake and operator routes. `/metrics` is mounted separately since it
/// carries its own state.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/events", post(events::submit_notification))
        .route("/api/v1/jobs", post(events::submit_event))
        .route("/api/v1/jobs/{key}", get(jobs::get_job))
        .route("/api/v1/jobs/{key}/cancel", post(jobs::cancel_job))
        .route("/api/v1/jobs/{key}/archive", post(jobs::archive_job))
        .route("/api/v1/results", get(jobs::get_results))
        .with_state(state)
}

/// Error body shared by all handlers.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: Option<ErrorKind>,
    message: String,
}

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            kind: None,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(error = %message, "Request failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: None,
            message,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.message,
            kind: self.kind,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        let kind = e.kind();
        let status = match &e {
            DispatchError::ObjectNotFound { .. } => StatusCode::NOT_FOUND,
            _ if kind == ErrorKind::PermanentInput => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self {
            status,
            kind: Some(kind),
            message: e.to_string(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        tracing::error!(error = %e, "Job store request failed");
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            kind: Some(ErrorKind::TransientInfra),
            message: e.to_string(),
        }
    }
}
