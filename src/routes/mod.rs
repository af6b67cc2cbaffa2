pub mod health;
pub mod jobs;
pub mod metrics;

use axum::routing::{get, post};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;

/// API routes with the standard middleware stack. `/metrics` is mounted by
/// the server binary, which owns the recorder.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/jobs", post(jobs::submit_job))
        .route("/api/v1/jobs/{job_id}", get(jobs::get_job_status))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(64 * 1024))
}
