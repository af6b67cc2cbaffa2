use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::submission::{JobStatusResponse, SubmitRequest, SubmitResponse};
use crate::pipeline::SubmitError;
use crate::services::job_store::StoreError;

/// Error body returned by the job endpoints.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<SubmitError> for ApiError {
    fn from(e: SubmitError) -> Self {
        if e.is_client_error() {
            ApiError {
                status: StatusCode::BAD_REQUEST,
                message: e.to_string(),
            }
        } else {
            tracing::error!(error = %e, "Failed to submit job");
            ApiError {
                status: StatusCode::SERVICE_UNAVAILABLE,
                message: "job could not be queued".to_string(),
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        tracing::error!(error = %e, "Job store unavailable");
        ApiError {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: "job store unavailable".to_string(),
        }
    }
}

/// POST /api/v1/jobs: submit a media file for detection.
pub async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let job = state.submitter.submit(request).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id: job.id,
            status: "pending".to_string(),
            message: "Job accepted for detection".to_string(),
        }),
    ))
}

/// GET /api/v1/jobs/{job_id}: poll a job's status.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job_id = Uuid::parse_str(&job_id).map_err(|_| ApiError {
        status: StatusCode::BAD_REQUEST,
        message: format!("invalid job id: {job_id}"),
    })?;

    match state.submitter.status(job_id).await? {
        Some(status) => Ok(Json(JobStatusResponse { job_id, status })),
        None => Err(ApiError {
            status: StatusCode::NOT_FOUND,
            message: format!("unknown job: {job_id}"),
        }),
    }
}
