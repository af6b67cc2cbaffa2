use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::JobStatus;

/// Request to submit a media file for detection.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct SubmitRequest {
    /// Remote object key of the input artifact.
    #[garde(length(min = 1, max = 1024))]
    pub source_ref: String,

    /// `"image"` or `"video"`; parsed after validation so an unknown kind
    /// maps to its own error.
    #[garde(length(min = 1, max = 16))]
    pub media_kind: String,

    #[garde(skip)]
    #[serde(default)]
    pub class_filter: Option<Vec<u32>>,
}

/// Response after a job has been accepted.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub status: String,
    pub message: String,
}

/// Response for querying job status.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    #[serde(flatten)]
    pub status: JobStatus,
}
