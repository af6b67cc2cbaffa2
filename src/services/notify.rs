use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::models::job::{Job, JobError};

/// Terminal outcome announced to callbacks.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Succeeded { job: Job },
    Failed { job: Job, error: JobError },
}

/// Receivers of terminal-job notifications (e.g. persistence elsewhere).
#[async_trait]
pub trait JobCallbacks: Send + Sync {
    /// Called for `Completed` and `Stopped` jobs.
    async fn on_success(&self, job: &Job) -> Result<(), NotifyError>;

    async fn on_failure(&self, job: &Job, error: &JobError) -> Result<(), NotifyError>;
}

/// Best-effort, fire-and-forget notification channel.
///
/// Events are handed to a background task; neither a closed channel nor a
/// failing callback is reported back to the pipeline.
#[derive(Clone, Default)]
pub struct Notifier {
    tx: Option<mpsc::UnboundedSender<JobEvent>>,
}

impl Notifier {
    /// A notifier that drops every event.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn spawn(callbacks: Arc<dyn JobCallbacks>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<JobEvent>();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let result = match &event {
                    JobEvent::Succeeded { job } => callbacks.on_success(job).await,
                    JobEvent::Failed { job, error } => callbacks.on_failure(job, error).await,
                };
                if let Err(e) = result {
                    tracing::warn!(error = %e, "Job callback failed");
                }
            }
        });
        (Self { tx: Some(tx) }, handle)
    }

    pub fn notify(&self, event: JobEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                tracing::warn!("Notification channel closed, dropping job event");
            }
        }
    }
}

/// POSTs each event as JSON to a configured URL.
pub struct WebhookCallbacks {
    http: Client,
    url: String,
}

impl WebhookCallbacks {
    pub fn new(url: &str) -> Self {
        Self {
            http: Client::new(),
            url: url.to_string(),
        }
    }

    async fn post(&self, event: &JobEvent) -> Result<(), NotifyError> {
        self.http
            .post(&self.url)
            .json(event)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl JobCallbacks for WebhookCallbacks {
    async fn on_success(&self, job: &Job) -> Result<(), NotifyError> {
        self.post(&JobEvent::Succeeded { job: job.clone() }).await
    }

    async fn on_failure(&self, job: &Job, error: &JobError) -> Result<(), NotifyError> {
        self.post(&JobEvent::Failed {
            job: job.clone(),
            error: error.clone(),
        })
        .await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Webhook request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Callback failed: {0}")]
    Callback(String),
}
