use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and register the pipeline's metrics.
/// Called once per process, by the server and by the worker.
pub fn install_recorder() -> Result<Arc<PrometheusHandle>, metrics_exporter_prometheus::BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    metrics::describe_counter!(
        "pipeline_jobs_submitted_total",
        "Upload events that created or re-opened a job"
    );
    metrics::describe_counter!(
        "pipeline_jobs_duplicate_total",
        "Upload events answered with an existing job"
    );
    metrics::describe_counter!(
        "pipeline_dispatch_failed_total",
        "Jobs failed because the queue could not accept them"
    );
    metrics::describe_counter!(
        "pipeline_jobs_completed_total",
        "Jobs that reached DONE"
    );
    metrics::describe_counter!(
        "pipeline_jobs_failed_total",
        "Jobs that reached FAILED, by error kind"
    );
    metrics::describe_counter!(
        "pipeline_jobs_retried_total",
        "Jobs released back to PENDING after a transient failure"
    );
    metrics::describe_histogram!(
        "pipeline_classification_seconds",
        "Time spent in the label detection call"
    );
    metrics::describe_gauge!(
        "pipeline_queue_depth",
        "Deliveries waiting in the ready list"
    );

    Ok(Arc::new(handle))
}

/// Prometheus metrics scrape endpoint.
/// Returns metrics in Prometheus text exposition format.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}
