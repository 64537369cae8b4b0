use std::sync::Arc;

use axum::routing::get;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use image_label_pipeline::app_state::AppState;
use image_label_pipeline::config::AppConfig;
use image_label_pipeline::db::{self, jobs::PgJobStore, results::PgResultTable};
use image_label_pipeline::routes;
use image_label_pipeline::services::queue::RedisJobQueue;
use image_label_pipeline::services::storage::{ObjectStore, S3ObjectStore};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing image-label-pipeline dispatcher");

    let prometheus_handle =
        routes::metrics::install_recorder().expect("Failed to install Prometheus metrics recorder");

    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    tracing::info!("Connecting to Redis job queue");
    let queue = RedisJobQueue::new(&config.redis_url).expect("Failed to initialize job queue");

    let objects: Option<Arc<dyn ObjectStore>> = match config.s3_credentials() {
        Some((access_key, secret_key)) => {
            tracing::info!(region = %config.s3_region, "Initializing object version lookups");
            let store: Arc<dyn ObjectStore> = Arc::new(S3ObjectStore::new(
                config.s3_endpoint.as_deref(),
                &config.s3_region,
                access_key,
                secret_key,
            )
            .expect("Failed to initialize object store client"));
            Some(store)
        }
        None => {
            tracing::warn!("S3 credentials not set; events without a version use the unversioned key");
            None
        }
    };

    let state = AppState::new(
        Arc::new(PgJobStore::new(db_pool.clone())),
        Arc::new(PgResultTable::new(db_pool)),
        Arc::new(queue),
        objects,
        config.dispatcher_config(),
        config.call_retry(),
    );

    let app = routes::api_router(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(1024 * 1024)); // 1 MB limit

    tracing::info!("Starting image-label-pipeline on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown signal received");
        })
        .await
        .expect("Server error");
}
