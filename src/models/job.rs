use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::models::detection::{DetectOutcome, DetectionSummary};

/// Kind of media referenced by a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum MediaKind {
    Image,
    Video,
}

/// Position of a job in the fixed fetch → detect → publish chain.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    Fetching,
    Detecting,
    Publishing,
    Completed,
    Stopped,
    Failed,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Completed | Stage::Stopped | Stage::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// The chain only moves forward; any non-terminal stage may divert to
    /// `Stopped` or `Failed`, and terminal stages accept nothing.
    pub fn can_transition_to(self, next: Stage) -> bool {
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Stage::Stopped | Stage::Failed) => true,
            (Stage::Fetching, Stage::Detecting)
            | (Stage::Detecting, Stage::Publishing)
            | (Stage::Publishing, Stage::Completed) => true,
            _ => false,
        }
    }
}

/// Optional restriction of detection to a set of class ids.
pub type ClassFilter = BTreeSet<u32>;

/// Machine-checkable failure kind surfaced through the status interface.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    InputNotFound,
    TransferError,
    UnsupportedMediaKind,
    StageTimeout,
    DetectionFailed,
    Internal,
}

/// Failure detail recorded once on a failed job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

/// The durable record of one submitted request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub source_ref: String,
    pub media_kind: MediaKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_filter: Option<ClassFilter>,
    pub stage: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_input_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_output_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detection: Option<DetectOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    #[serde(default)]
    pub terminated: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(source_ref: String, media_kind: MediaKind, class_filter: Option<ClassFilter>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            source_ref,
            media_kind,
            class_filter: class_filter.filter(|f| !f.is_empty()),
            stage: Stage::Fetching,
            local_input_path: None,
            local_output_path: None,
            detection: None,
            published_ref: None,
            error: None,
            terminated: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Summary produced by the detect stage, if anything was found.
    pub fn detection_summary(&self) -> Option<&DetectionSummary> {
        match &self.detection {
            Some(DetectOutcome::Detected { summary, .. }) => Some(summary),
            _ => None,
        }
    }

    /// Move to `next`, refusing transitions that go backwards or leave a
    /// terminal stage.
    pub fn transition(&mut self, next: Stage) -> Result<(), InvalidTransition> {
        if !self.stage.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.stage,
                to: next,
            });
        }
        self.stage = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record a terminal failure. The error is only ever set once.
    pub fn fail(&mut self, error: JobError) -> Result<(), InvalidTransition> {
        self.transition(Stage::Failed)?;
        self.error.get_or_insert(error);
        Ok(())
    }

    /// Status as seen by polling clients.
    pub fn status(&self) -> JobStatus {
        match self.stage {
            Stage::Completed => JobStatus::Completed {
                detection_summary: self.detection_summary().cloned().unwrap_or_default(),
                published_ref: self.published_ref.clone().unwrap_or_default(),
            },
            Stage::Stopped => JobStatus::Stopped {
                reason: NO_DETECTIONS_REASON.to_string(),
            },
            Stage::Failed => JobStatus::Failed {
                error: self.error.clone().unwrap_or(JobError {
                    kind: ErrorKind::Internal,
                    message: "job failed without recorded detail".to_string(),
                }),
            },
            stage => JobStatus::Pending { stage },
        }
    }
}

pub const NO_DETECTIONS_REASON: &str = "no detections";

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal stage transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: Stage,
    pub to: Stage,
}

/// Externally visible state of a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Pending {
        stage: Stage,
    },
    Completed {
        detection_summary: DetectionSummary,
        published_ref: String,
    },
    Stopped {
        reason: String,
    },
    Failed {
        error: JobError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::detection::ClassCount;
    use std::str::FromStr;

    fn sample_job() -> Job {
        Job::new("clips/a.jpg".to_string(), MediaKind::Image, None)
    }

    #[test]
    fn test_forward_chain_is_legal() {
        let mut job = sample_job();
        assert!(job.transition(Stage::Detecting).is_ok());
        assert!(job.transition(Stage::Publishing).is_ok());
        assert!(job.transition(Stage::Completed).is_ok());
        assert_eq!(job.stage, Stage::Completed);
    }

    #[test]
    fn test_no_reentry_or_skipping() {
        let mut job = sample_job();
        assert!(job.transition(Stage::Publishing).is_err());
        job.transition(Stage::Detecting).unwrap();
        assert!(job.transition(Stage::Fetching).is_err());
        assert!(job.transition(Stage::Detecting).is_err());
    }

    #[test]
    fn test_terminal_stages_are_frozen() {
        for terminal in [Stage::Completed, Stage::Stopped, Stage::Failed] {
            for next in [Stage::Fetching, Stage::Publishing, Stage::Failed, Stage::Stopped] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn test_error_is_set_once() {
        let mut job = sample_job();
        job.fail(JobError {
            kind: ErrorKind::InputNotFound,
            message: "missing".to_string(),
        })
        .unwrap();
        assert!(job
            .fail(JobError {
                kind: ErrorKind::Internal,
                message: "again".to_string(),
            })
            .is_err());
        assert_eq!(job.error.unwrap().kind, ErrorKind::InputNotFound);
    }

    #[test]
    fn test_status_mapping() {
        let mut job = sample_job();
        assert_eq!(job.status(), JobStatus::Pending { stage: Stage::Fetching });

        let mut summary = DetectionSummary::new();
        summary.insert("person".to_string(), ClassCount { count: 1, class_id: 0 });
        job.detection = Some(DetectOutcome::Detected {
            summary: summary.clone(),
            output_path: PathBuf::from("output/x/a.jpg"),
        });
        job.published_ref = Some("output/a.jpg".to_string());
        job.stage = Stage::Completed;
        assert_eq!(
            job.status(),
            JobStatus::Completed {
                detection_summary: summary,
                published_ref: "output/a.jpg".to_string(),
            }
        );
    }

    #[test]
    fn test_status_serializes_with_tag() {
        let status = JobStatus::Stopped {
            reason: NO_DETECTIONS_REASON.to_string(),
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["status"], "stopped");
        assert_eq!(value["reason"], "no detections");
    }

    #[test]
    fn test_media_kind_parsing() {
        assert_eq!(MediaKind::from_str("image").unwrap(), MediaKind::Image);
        assert_eq!(MediaKind::from_str("VIDEO").unwrap(), MediaKind::Video);
        assert!(MediaKind::from_str("audio").is_err());
    }

    #[test]
    fn test_empty_filter_is_dropped() {
        let job = Job::new("a.mp4".to_string(), MediaKind::Video, Some(ClassFilter::new()));
        assert!(job.class_filter.is_none());
    }
}
