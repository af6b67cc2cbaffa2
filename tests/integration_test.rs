//! Tests against live infrastructure.
//!
//! These require PostgreSQL, Redis and an S3-compatible bucket configured
//! via the usual environment variables (see `AppConfig`).
//!
//! Run with: cargo test --test integration_test -- --ignored

use std::sync::Arc;

use detect_pipeline::{
    config::AppConfig,
    db,
    models::job::{Job, MediaKind, Stage},
    services::{
        job_store::{JobStore, PgJobStore},
        queue::{RedisStageQueue, StageMessage, StageQueue},
        storage::S3Client,
        transfer::TransferEngine,
    },
};
use uuid::Uuid;

#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_postgres_job_store() {
    let config = AppConfig::from_env().expect("Failed to load config");
    let pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&pool).await.expect("Failed to run migrations");
    let store = PgJobStore::new(pool);

    let job = Job::new("clips/it.jpg".to_string(), MediaKind::Image, None);
    store.create(&job).await.expect("Failed to create job");
    assert!(store.create(&job).await.is_err(), "duplicate create must fail");

    let mut next = job.clone();
    next.transition(Stage::Detecting).unwrap();
    assert!(store.compare_and_set(job.id, Stage::Fetching, &next).await.unwrap());
    assert!(!store.compare_and_set(job.id, Stage::Fetching, &next).await.unwrap());

    let stored = store.get(job.id).await.unwrap().expect("Job not found");
    assert_eq!(stored.stage, Stage::Detecting);
    assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
#[ignore]
async fn test_redis_stage_queue() {
    let config = AppConfig::from_env().expect("Failed to load config");
    let queue = RedisStageQueue::new(&config.redis_url, &format!("it-{}", Uuid::new_v4()))
        .expect("Failed to initialize queue");
    queue.health_check().await.expect("Redis unreachable");

    let job = Job::new("clips/it.mp4".to_string(), MediaKind::Video, None);
    queue.dispatch(&StageMessage::new(job.clone())).await.unwrap();

    // Other tests may share the queue; look for our message.
    let mut found = None;
    while let Some(delivery) = queue.receive().await.unwrap() {
        if delivery.message.job.id == job.id {
            found = Some(delivery);
            break;
        }
        queue.nack(&delivery).await.unwrap();
    }
    let delivery = found.expect("dispatched message not received");
    assert_eq!(delivery.message.attempt, 0);
    queue.ack(&delivery).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_redis_recovery_leaves_other_consumers_alone() {
    let config = AppConfig::from_env().expect("Failed to load config");
    let busy = RedisStageQueue::new(&config.redis_url, &format!("it-busy-{}", Uuid::new_v4())).unwrap();
    let restarted = RedisStageQueue::new(&config.redis_url, &format!("it-restarted-{}", Uuid::new_v4())).unwrap();

    let job = Job::new("clips/held.mp4".to_string(), MediaKind::Video, None);
    busy.dispatch(&StageMessage::new(job.clone())).await.unwrap();
    let mut held = None;
    while let Some(delivery) = busy.receive().await.unwrap() {
        if delivery.message.job.id == job.id {
            held = Some(delivery);
            break;
        }
        busy.nack(&delivery).await.unwrap();
    }
    let held = held.expect("dispatched message not received");

    assert_eq!(restarted.recover_in_flight().await.unwrap(), 0);
    assert_eq!(busy.recover_in_flight().await.unwrap(), 1);

    loop {
        let delivery = busy.receive().await.unwrap().expect("recovered message missing");
        if delivery.message == held.message {
            busy.ack(&delivery).await.unwrap();
            break;
        }
        busy.nack(&delivery).await.unwrap();
    }
}

#[tokio::test]
#[ignore]
async fn test_s3_round_trip_through_transfer_engine() {
    let config = AppConfig::from_env().expect("Failed to load config");
    let client = S3Client::new(
        &config.s3_bucket,
        &config.s3_endpoint,
        &config.s3_region,
        &config.s3_access_key,
        &config.s3_secret_key,
    )
    .expect("Failed to initialize S3 client");
    let dir = tempfile::tempdir().unwrap();
    let mut transfer_config = config.transfer_config();
    transfer_config.record_dir = dir.path().join("records");
    let engine = TransferEngine::new(Arc::new(client), transfer_config);

    // Large enough to take the multipart path with default part sizes.
    let local = dir.path().join("payload.bin");
    let payload: Vec<u8> = (0..300 * 1024).map(|i| (i % 253) as u8).collect();
    std::fs::write(&local, &payload).unwrap();

    let prefix = format!("test/{}", Uuid::new_v4());
    let key = engine.upload(&local, &prefix).await.expect("Upload failed");
    assert_eq!(key, format!("{prefix}/payload.bin"));

    let fetched = engine
        .download(&key, &dir.path().join("fetched"))
        .await
        .expect("Download failed");
    assert_eq!(std::fs::read(fetched).unwrap(), payload);
}

#[tokio::test]
#[ignore] // Requires the API server; set API_BASE_URL to override
async fn test_running_server_health() {
    let base_url = std::env::var("API_BASE_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());
    let response = reqwest::get(format!("{base_url}/health"))
        .await
        .expect("Health check failed");
    assert!(response.status().is_success(), "health returned {}", response.status());
}
