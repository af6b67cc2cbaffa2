use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use detect_pipeline::{
    config::AppConfig,
    db,
    pipeline::{StageExecutor, StageWorkers},
    services::{
        detector::HttpDetector,
        job_store::{JobStore, PgJobStore},
        media::{Annotator, FfmpegCodec},
        notify::{Notifier, WebhookCallbacks},
        queue::RedisStageQueue,
        storage::S3Client,
        transfer::TransferEngine,
    },
};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::watch;
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

    tracing::info!("Starting detection worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    let metrics_addr: SocketAddr = config
        .worker_metrics_addr
        .parse()
        .expect("Invalid WORKER_METRICS_ADDR");
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .expect("Failed to install Prometheus exporter");
    detect_pipeline::routes::metrics::describe_metrics();

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");
    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(db_pool));

    tracing::info!("Initializing services");
    let object_store = S3Client::new(
        &config.s3_bucket,
        &config.s3_endpoint,
        &config.s3_region,
        &config.s3_access_key,
        &config.s3_secret_key,
    )
    .expect("Failed to initialize object storage client");
    let transfer = TransferEngine::new(Arc::new(object_store), config.transfer_config());

    let queue = Arc::new(
        RedisStageQueue::new(&config.redis_url, &config.worker_id).expect("Failed to initialize stage queue"),
    );

    // One detector per process, shared by every detect stage.
    let detector = Arc::new(HttpDetector::new(&config.detector_url));

    let annotator = match &config.annotation_font {
        Some(path) => Annotator::with_font_file(path)
            .await
            .expect("Failed to load annotation font"),
        None => Annotator::new(),
    };

    let workers = StageWorkers::new(
        transfer,
        detector,
        Arc::new(FfmpegCodec),
        config.work_dirs(),
        config.output_prefix.clone(),
    )
    .with_annotator(annotator);

    let (notifier, notify_task) = match &config.callback_url {
        Some(url) => {
            let (notifier, handle) = Notifier::spawn(Arc::new(WebhookCallbacks::new(url)));
            (notifier, Some(handle))
        }
        None => (Notifier::disabled(), None),
    };

    let executor = Arc::new(StageExecutor::new(
        store.clone(),
        queue,
        Arc::new(workers),
        notifier,
        config.pipeline_config(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Periodically drop expired terminal job records
    let ttl = config.job_ttl();
    let evictor = tokio::spawn(async move {
        let mut interval = tokio::time::interval(ttl.clamp(Duration::from_secs(1), Duration::from_secs(3600)));
        loop {
            interval.tick().await;
            match store.evict_expired(ttl).await {
                Ok(0) => {}
                Ok(evicted) => tracing::info!(evicted, "Evicted expired job records"),
                Err(e) => tracing::warn!(error = %e, "Failed to evict expired job records"),
            }
        }
    });

    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutdown signal received, finishing running stages");
        let _ = shutdown_tx.send(true);
    });

    tracing::info!(
        worker_id = %config.worker_id,
        max_concurrent_jobs = config.max_concurrent_jobs,
        "Worker ready, starting stage processing loop"
    );

    if let Err(e) = executor
        .clone()
        .run(config.max_concurrent_jobs, config.poll_interval(), shutdown_rx)
        .await
    {
        tracing::error!(error = %e, "Worker loop stopped");
    }

    evictor.abort();
    drop(executor);
    if let Some(handle) = notify_task {
        let _ = handle.await;
    }
    tracing::info!("Worker stopped");
}
