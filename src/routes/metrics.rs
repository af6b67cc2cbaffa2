use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;

/// GET /metrics: Prometheus text exposition of the pipeline counters.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}

/// Register descriptions for every metric the pipeline records.
pub fn describe_metrics() {
    metrics::describe_counter!("detect_jobs_submitted_total", "Total detection jobs submitted");
    metrics::describe_counter!("detect_jobs_completed_total", "Jobs that published an annotated artifact");
    metrics::describe_counter!("detect_jobs_stopped_total", "Jobs stopped because nothing was detected");
    metrics::describe_counter!("detect_jobs_failed_total", "Jobs that failed, by error kind");
    metrics::describe_histogram!("detect_stage_seconds", "Wall time of one stage run");
    metrics::describe_counter!("detect_stage_retries_total", "Stage-level retries, by stage");
    metrics::describe_gauge!("detect_queue_depth", "Pending stage messages");
}
