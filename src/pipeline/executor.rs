use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::models::job::{Job, Stage};
use crate::pipeline::{Deadline, ExecutorError, PipelineConfig, StageError, StageWorkers};
use crate::services::job_store::JobStore;
use crate::services::notify::{JobEvent, Notifier};
use crate::services::queue::{Delivery, StageMessage, StageQueue};

/// What happened to one stage message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// The stage ran and the next one was dispatched.
    Advanced(Stage),
    /// The job reached a terminal stage.
    Finished(Stage),
    /// The stage failed and was re-dispatched.
    Retried,
    /// Stale or duplicate message; nothing changed.
    Skipped,
}

/// Consumes stage messages and drives jobs through the chain.
pub struct StageExecutor {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn StageQueue>,
    workers: Arc<StageWorkers>,
    notifier: Notifier,
    config: PipelineConfig,
}

impl StageExecutor {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn StageQueue>,
        workers: Arc<StageWorkers>,
        notifier: Notifier,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            queue,
            workers,
            notifier,
            config,
        }
    }

    /// Run the stage named by `message` and commit its result.
    ///
    /// A message whose stage no longer matches the stored job is a
    /// duplicate delivery and is skipped without side effects.
    pub async fn handle(&self, message: StageMessage) -> Result<HandleOutcome, ExecutorError> {
        let job = message.job.clone();
        let expected = job.stage;

        if expected.is_terminal() {
            warn!(job_id = %job.id, stage = %expected, "Ignoring message for terminal stage");
            return Ok(HandleOutcome::Skipped);
        }
        match self.store.get(job.id).await? {
            Some(current) if current.stage == expected => {}
            // Committed but the successor may never have been dispatched.
            // A duplicate successor is skipped by its own stage check.
            Some(current) if !current.stage.is_terminal() && expected.can_transition_to(current.stage) => {
                info!(
                    job_id = %job.id,
                    message_stage = %expected,
                    stored_stage = %current.stage,
                    "Stage already committed, re-dispatching its successor"
                );
                self.queue.dispatch(&StageMessage::new(current)).await?;
                return Ok(HandleOutcome::Skipped);
            }
            Some(current) => {
                info!(
                    job_id = %job.id,
                    message_stage = %expected,
                    stored_stage = %current.stage,
                    "Skipping stale stage message"
                );
                return Ok(HandleOutcome::Skipped);
            }
            None => {
                warn!(job_id = %job.id, "Skipping message for unknown job");
                return Ok(HandleOutcome::Skipped);
            }
        }

        info!(job_id = %job.id, stage = %expected, attempt = message.attempt, "Running stage");
        let started = Instant::now();
        let final_attempt = message.attempt >= self.config.max_redeliveries;
        let result = self.run_with_deadline(job.clone(), final_attempt).await;
        metrics::histogram!("detect_stage_seconds", "stage" => expected.to_string())
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(next) => self.commit(expected, next).await,
            Err(err) if err.retryable && message.attempt < self.config.max_redeliveries => {
                warn!(
                    job_id = %job.id,
                    stage = %expected,
                    attempt = message.attempt,
                    error = %err,
                    "Stage failed, retrying"
                );
                metrics::counter!("detect_stage_retries_total", "stage" => expected.to_string())
                    .increment(1);
                self.queue.dispatch(&message.retry()).await?;
                Ok(HandleOutcome::Retried)
            }
            Err(err) => self.fail(expected, job, err).await,
        }
    }

    async fn run_with_deadline(&self, job: Job, final_attempt: bool) -> Result<Job, StageError> {
        let (tx, rx) = watch::channel(false);
        let deadline = Deadline::new(rx);
        let job_id = job.id;
        let stage = job.stage;

        let fut = self.workers.run(job, &deadline, final_attempt);
        tokio::pin!(fut);

        tokio::select! {
            result = &mut fut => result,
            _ = tokio::time::sleep(self.config.soft_time_limit) => {
                warn!(job_id = %job_id, stage = %stage, "Soft time limit reached, signalling stage");
                let _ = tx.send(true);
                match tokio::time::timeout(self.config.kill_grace, &mut fut).await {
                    Ok(result) => result,
                    Err(_) => {
                        error!(job_id = %job_id, stage = %stage, "Stage ignored time limit, abandoning it");
                        Err(StageError::timeout())
                    }
                }
            }
        }
    }

    async fn commit(&self, expected: Stage, next: Job) -> Result<HandleOutcome, ExecutorError> {
        if !self.store.compare_and_set(next.id, expected, &next).await? {
            warn!(job_id = %next.id, stage = %expected, "Job moved on concurrently, dropping result");
            return Ok(HandleOutcome::Skipped);
        }

        if next.stage.is_terminal() {
            match next.stage {
                Stage::Stopped => metrics::counter!("detect_jobs_stopped_total").increment(1),
                _ => metrics::counter!("detect_jobs_completed_total").increment(1),
            }
            info!(
                job_id = %next.id,
                stage = %next.stage,
                published_ref = next.published_ref.as_deref().unwrap_or(""),
                "Job finished"
            );
            let stage = next.stage;
            self.notifier.notify(JobEvent::Succeeded { job: next });
            return Ok(HandleOutcome::Finished(stage));
        }

        if let Err(e) = self.queue.dispatch(&StageMessage::new(next.clone())).await {
            error!(job_id = %next.id, error = %e, "Failed to dispatch next stage");
            let stage_error = StageError::internal(format!("failed to dispatch {} stage: {e}", next.stage));
            let stage = next.stage;
            self.fail(stage, next, stage_error).await?;
            return Err(e.into());
        }
        debug!(job_id = %next.id, stage = %next.stage, "Next stage dispatched");
        Ok(HandleOutcome::Advanced(next.stage))
    }

    async fn fail(&self, expected: Stage, mut job: Job, err: StageError) -> Result<HandleOutcome, ExecutorError> {
        error!(job_id = %job.id, stage = %expected, kind = %err.kind, error = %err.message, "Job failed");

        // Idempotent; publish may already have cleaned up.
        self.workers.cleanup(&job).await;

        let job_error = err.to_job_error();
        if job.fail(job_error.clone()).is_err() {
            return Ok(HandleOutcome::Skipped);
        }
        if !self.store.compare_and_set(job.id, expected, &job).await? {
            warn!(job_id = %job.id, "Job moved on concurrently, not recording failure");
            return Ok(HandleOutcome::Skipped);
        }

        metrics::counter!("detect_jobs_failed_total", "kind" => err.kind.to_string()).increment(1);
        self.notifier.notify(JobEvent::Failed { job, error: job_error });
        Ok(HandleOutcome::Finished(Stage::Failed))
    }

    async fn process(&self, delivery: Delivery) {
        let job_id = delivery.message.job.id;
        match self.handle(delivery.message.clone()).await {
            Ok(outcome) => {
                debug!(job_id = %job_id, ?outcome, "Stage message handled");
                if let Err(e) = self.queue.ack(&delivery).await {
                    error!(job_id = %job_id, error = %e, "Failed to ack stage message");
                }
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Stage message not handled, returning to queue");
                if let Err(e) = self.queue.nack(&delivery).await {
                    error!(job_id = %job_id, error = %e, "Failed to nack stage message");
                }
            }
        }
    }

    /// Handle queued messages one at a time until the queue is empty.
    /// Returns how many messages were processed.
    pub async fn drain(&self) -> Result<usize, ExecutorError> {
        let mut processed = 0;
        while let Some(delivery) = self.queue.receive().await? {
            self.process(delivery).await;
            processed += 1;
        }
        Ok(processed)
    }

    /// Worker loop: up to `max_concurrent` stages in flight, polling every
    /// `poll_interval` while idle, until `shutdown` flips to true.
    pub async fn run(
        self: Arc<Self>,
        max_concurrent: usize,
        poll_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ExecutorError> {
        let recovered = self.queue.recover_in_flight().await?;
        if recovered > 0 {
            info!(recovered, "Returned in-flight stage messages to the queue");
        }

        let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
        let mut tasks = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            match self.queue.receive().await {
                Ok(Some(delivery)) => {
                    let this = self.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        this.process(delivery).await;
                    });
                }
                Ok(None) => {
                    drop(permit);
                    if let Ok(depth) = self.queue.depth().await {
                        metrics::gauge!("detect_queue_depth").set(depth as f64);
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!(error = %e, "Failed to receive stage message");
                    tokio::select! {
                        _ = tokio::time::sleep(poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }

            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "Stage task panicked");
                }
            }
        }

        info!(in_flight = tasks.len(), "Shutting down, waiting for running stages");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Stage task panicked");
            }
        }
        Ok(())
    }
}
