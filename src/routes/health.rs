use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::services::retry::RetryPolicy;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub job_store: ComponentHealth,
    pub queue: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

impl ComponentHealth {
    fn from_check<E: std::fmt::Display>(result: Result<(), E>, start: Instant) -> Self {
        match result {
            Ok(()) => Self {
                status: "ok".to_string(),
                latency_ms: Some(start.elapsed().as_millis() as u64),
            },
            Err(e) => {
                tracing::warn!(error = %e, "Health check failed");
                Self {
                    status: "error".to_string(),
                    latency_ms: None,
                }
            }
        }
    }

    fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// GET /health — job store and queue reachability.
///
/// Each check gets one attempt bounded by the handler call timeout, so a
/// hung backend reports as degraded instead of stalling the endpoint.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let single = RetryPolicy::once(state.call_retry.attempt_timeout);

    let start = Instant::now();
    let job_store = ComponentHealth::from_check(
        single.run("job_store_health", || state.jobs.health_check()).await,
        start,
    );

    let start = Instant::now();
    let queue = ComponentHealth::from_check(
        single.run("queue_health", || state.queue.health_check()).await,
        start,
    );

    let all_healthy = job_store.is_ok() && queue.is_ok();
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if all_healthy { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks { job_store, queue },
    };

    (status_code, Json(response))
}
