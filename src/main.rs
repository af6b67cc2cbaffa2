use std::sync::Arc;

use axum::{routing::get, Router};
use detect_pipeline::{
    app_state::AppState,
    config::AppConfig,
    db,
    routes,
    services::{job_store::PgJobStore, queue::RedisStageQueue},
};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing detect-pipeline API server");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    routes::metrics::describe_metrics();

    tracing::info!("Connecting to PostgreSQL job store");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    tracing::info!("Connecting to Redis stage queue");
    // The API only dispatches; it never holds in-flight messages.
    let queue = RedisStageQueue::new(&config.redis_url, "api").expect("Failed to initialize stage queue");

    let state = AppState::new(Arc::new(PgJobStore::new(db_pool)), Arc::new(queue));

    let app = routes::router(state).merge(
        Router::new()
            .route("/metrics", get(routes::metrics::prometheus_metrics))
            .with_state(prometheus_handle),
    );

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await
        .expect("Server error");
}
