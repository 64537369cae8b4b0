use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing_subscriber::EnvFilter;

use image_label_pipeline::config::AppConfig;
use image_label_pipeline::db::{self, jobs::PgJobStore, results::PgResultTable};
use image_label_pipeline::db::store::{JobStore, ResultTable};
use image_label_pipeline::routes;
use image_label_pipeline::services::classifier::{Classifier, HttpClassifier};
use image_label_pipeline::services::queue::{JobQueue, RedisJobQueue};
use image_label_pipeline::services::reaper::{reap_stale_jobs, ReaperConfig};
use image_label_pipeline::services::worker::{ProcessOutcome, Worker};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting label worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    let prometheus_handle =
        routes::metrics::install_recorder().expect("Failed to install Prometheus metrics recorder");
    if let Some(addr) = config.worker_metrics_addr.clone() {
        let app = Router::new().route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        );
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .expect("Failed to bind metrics address");
        tracing::info!("Worker metrics listening on {}", addr);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "Metrics server stopped");
            }
        });
    }

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Initializing services");
    let jobs: Arc<dyn JobStore> = Arc::new(PgJobStore::new(db_pool.clone()));
    let results: Arc<dyn ResultTable> = Arc::new(PgResultTable::new(db_pool));
    let queue: Arc<dyn JobQueue> =
        Arc::new(RedisJobQueue::new(&config.redis_url).expect("Failed to initialize job queue"));
    let classifier: Arc<dyn Classifier> = Arc::new(
        HttpClassifier::new(
            config.classifier_endpoint.clone(),
            config.classifier_api_token.clone(),
            config.classifier_timeout(),
            config.classifier_max_labels,
            config.classifier_min_confidence,
        )
        .expect("Failed to initialize classifier client"),
    );

    let worker = Worker::new(
        jobs.clone(),
        results,
        queue.clone(),
        classifier,
        config.worker_config(),
    );
    tracing::info!(worker_id = %worker.id(), "Worker ready, starting job processing loop");

    let reaper_config = config.reaper_config();
    let reaper = tokio::spawn(run_reaper(
        jobs,
        queue,
        reaper_config,
        config.reaper_interval(),
    ));

    tokio::select! {
        _ = process_loop(&worker, config.poll_interval()) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received, stopping worker");
        }
    }
    reaper.abort();
}

async fn process_loop(worker: &Worker, poll_interval: Duration) {
    loop {
        match worker.run_once().await {
            Ok(Some(outcome)) => {
                // Job handled, continue immediately
                if let ProcessOutcome::Failed { kind, reason } = &outcome {
                    tracing::debug!(kind = %kind, reason = %reason, "Delivery ended in failure");
                }
            }
            Ok(None) => {
                tracing::trace!("No jobs available, sleeping");
                sleep(poll_interval).await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Error processing job, will retry");
                sleep(poll_interval).await;
            }
        }
    }
}

async fn run_reaper(
    jobs: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    config: ReaperConfig,
    every: Duration,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;

        match config
            .queue_retry
            .run("queue_depth", || queue.depth())
            .await
        {
            Ok(depth) => metrics::gauge!("pipeline_queue_depth").set(depth as f64),
            Err(e) => tracing::warn!(error = %e, "Failed to read queue depth"),
        }

        match reap_stale_jobs(jobs.as_ref(), queue.as_ref(), &config).await {
            Ok(report) if report.is_empty() => tracing::debug!("Reaper sweep found nothing"),
            Ok(report) => tracing::info!(
                requeued = report.requeued.len(),
                failed = report.failed.len(),
                skipped = report.skipped,
                trimmed = report.trimmed,
                "Reaper sweep complete"
            ),
            Err(e) => tracing::error!(error = %e, "Reaper sweep failed"),
        }
    }
}
