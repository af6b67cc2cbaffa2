//! The fixed fetch → detect → publish job chain.
//!
//! [`Submitter`] records a job and dispatches its first stage. Workers run a
//! [`StageExecutor`], which takes one stage message at a time, runs the
//! matching stage under a soft deadline, writes the result to the job store
//! with a compare-and-set, and only then dispatches the next stage.

mod executor;
pub mod stages;
mod submit;

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::watch;

use crate::models::job::{ErrorKind, InvalidTransition, JobError};
use crate::services::detector::DetectorError;
use crate::services::job_store::StoreError;
use crate::services::media::MediaError;
use crate::services::queue::QueueError;
use crate::services::transfer::TransferError;

pub use executor::{HandleOutcome, StageExecutor};
pub use stages::StageWorkers;
pub use submit::{SubmitError, Submitter};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// After this long a stage is asked to stop.
    pub soft_time_limit: Duration,
    /// Extra time a signalled stage gets before it is dropped.
    pub kill_grace: Duration,
    /// Stage-level retries for retryable failures.
    pub max_redeliveries: u32,
    /// Remote prefix for published artifacts.
    pub output_prefix: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            soft_time_limit: Duration::from_secs(10_800),
            kill_grace: Duration::from_secs(30),
            max_redeliveries: 3,
            output_prefix: "output".to_string(),
        }
    }
}

/// Local directories owned by the stage workers.
#[derive(Debug, Clone)]
pub struct WorkDirs {
    /// Holds fetched input artifacts.
    pub scratch_dir: PathBuf,
    /// Holds one directory of annotated output per job.
    pub output_dir: PathBuf,
}

/// Cooperative stop signal raised when a stage hits its soft time limit.
#[derive(Debug, Clone)]
pub struct Deadline {
    rx: watch::Receiver<bool>,
}

impl Deadline {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// A deadline that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_expired(&self) -> bool {
        *self.rx.borrow()
    }

    pub fn check(&self) -> Result<(), StageError> {
        if self.is_expired() {
            Err(StageError::timeout())
        } else {
            Ok(())
        }
    }
}

/// Failure of one stage run, classified for the retry decision.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct StageError {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl StageError {
    pub fn terminal(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn retryable(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: true,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::terminal(ErrorKind::Internal, message)
    }

    pub fn timeout() -> Self {
        Self::terminal(ErrorKind::StageTimeout, "stage exceeded its time limit")
    }

    pub fn to_job_error(&self) -> JobError {
        JobError {
            kind: self.kind,
            message: self.message.clone(),
        }
    }
}

impl From<TransferError> for StageError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::NotFound(key) => {
                StageError::terminal(ErrorKind::InputNotFound, format!("input object not found: {key}"))
            }
            TransferError::InvalidPath(path) => {
                StageError::terminal(ErrorKind::InputNotFound, format!("invalid object reference: {path}"))
            }
            other => StageError::retryable(ErrorKind::TransferError, other.to_string()),
        }
    }
}

impl From<DetectorError> for StageError {
    fn from(e: DetectorError) -> Self {
        match e {
            DetectorError::Http(_) => StageError::retryable(ErrorKind::DetectionFailed, e.to_string()),
            DetectorError::Encode(_) => StageError::terminal(ErrorKind::DetectionFailed, e.to_string()),
        }
    }
}

impl From<MediaError> for StageError {
    fn from(e: MediaError) -> Self {
        StageError::terminal(ErrorKind::DetectionFailed, e.to_string())
    }
}

impl From<InvalidTransition> for StageError {
    fn from(e: InvalidTransition) -> Self {
        StageError::internal(e.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}
