use std::str::FromStr;
use std::sync::Arc;

use garde::Validate;
use uuid::Uuid;

use crate::models::job::{ClassFilter, ErrorKind, Job, JobError, JobStatus, MediaKind, Stage};
use crate::models::submission::SubmitRequest;
use crate::services::job_store::{JobStore, StoreError};
use crate::services::queue::{QueueError, StageMessage, StageQueue};

/// Entry point for new jobs and status queries.
#[derive(Clone)]
pub struct Submitter {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn StageQueue>,
}

impl Submitter {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<dyn StageQueue>) -> Self {
        Self { store, queue }
    }

    /// Record a new job in `Fetching` and dispatch its first stage.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Job, SubmitError> {
        request
            .validate()
            .map_err(|e| SubmitError::Invalid(e.to_string()))?;

        let source_ref = request.source_ref.trim();
        if source_ref.is_empty() {
            return Err(SubmitError::EmptySourceRef);
        }
        let media_kind = MediaKind::from_str(request.media_kind.trim())
            .map_err(|_| SubmitError::UnsupportedMediaKind(request.media_kind.clone()))?;
        let class_filter: Option<ClassFilter> = request.class_filter.map(|ids| ids.into_iter().collect());

        let job = Job::new(source_ref.to_string(), media_kind, class_filter);
        self.store.create(&job).await?;

        if let Err(e) = self.queue.dispatch(&StageMessage::new(job.clone())).await {
            // Nothing will ever pick the job up; fail it so pollers see why.
            let mut failed = job.clone();
            if failed
                .fail(JobError {
                    kind: ErrorKind::Internal,
                    message: format!("failed to dispatch first stage: {e}"),
                })
                .is_ok()
            {
                let _ = self.store.compare_and_set(job.id, Stage::Fetching, &failed).await;
            }
            return Err(e.into());
        }

        metrics::counter!("detect_jobs_submitted_total").increment(1);
        tracing::info!(
            job_id = %job.id,
            source_ref = %job.source_ref,
            media_kind = %job.media_kind,
            "Job submitted"
        );
        Ok(job)
    }

    pub async fn status(&self, job_id: Uuid) -> Result<Option<JobStatus>, StoreError> {
        Ok(self.store.get(job_id).await?.map(|job| job.status()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error("source_ref must not be empty")]
    EmptySourceRef,

    #[error("Unsupported media kind: {0}")]
    UnsupportedMediaKind(String),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

impl SubmitError {
    /// Whether the request itself was at fault.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            SubmitError::Invalid(_) | SubmitError::EmptySourceRef | SubmitError::UnsupportedMediaKind(_)
        )
    }
}
