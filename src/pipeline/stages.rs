//! Stage workers: thin adapters between a job record and the transfer
//! engine, the detector and the video codec.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::detection::{count_boxes, DetectOutcome, Detection, DetectionSummary, TrackCounter};
use crate::models::job::{ClassFilter, ErrorKind, Job, MediaKind, Stage};
use crate::pipeline::{Deadline, StageError, WorkDirs};
use crate::services::detector::{Detector, TrackSession};
use crate::services::media::{load_image, save_image, track_caption, Annotator, VideoCodec};
use crate::services::transfer::TransferEngine;

pub struct StageWorkers {
    transfer: TransferEngine,
    detector: Arc<dyn Detector>,
    codec: Arc<dyn VideoCodec>,
    dirs: WorkDirs,
    output_prefix: String,
    annotator: Annotator,
}

impl StageWorkers {
    pub fn new(
        transfer: TransferEngine,
        detector: Arc<dyn Detector>,
        codec: Arc<dyn VideoCodec>,
        dirs: WorkDirs,
        output_prefix: impl Into<String>,
    ) -> Self {
        Self {
            transfer,
            detector,
            codec,
            dirs,
            output_prefix: output_prefix.into(),
            annotator: Annotator::new(),
        }
    }

    pub fn with_annotator(mut self, annotator: Annotator) -> Self {
        self.annotator = annotator;
        self
    }

    /// Run the stage the job is currently in.
    ///
    /// `final_attempt` tells publish whether a transient upload failure
    /// will be retried; until then its artifact and resume record are kept.
    pub async fn run(&self, job: Job, deadline: &Deadline, final_attempt: bool) -> Result<Job, StageError> {
        match job.stage {
            Stage::Fetching => self.fetch(job).await,
            Stage::Detecting => self.detect(job, deadline).await,
            Stage::Publishing => self.publish(job, final_attempt).await,
            stage => Err(StageError::internal(format!("no worker for stage {stage}"))),
        }
    }

    /// Scratch location of a job's input: `<scratch>/<job_id>_<basename>`.
    pub fn scratch_path(&self, job: &Job) -> Result<PathBuf, StageError> {
        let name = source_name(&job.source_ref).ok_or_else(|| {
            StageError::terminal(
                ErrorKind::InputNotFound,
                format!("invalid object reference: {}", job.source_ref),
            )
        })?;
        Ok(self.dirs.scratch_dir.join(format!("{}_{}", job.id, name)))
    }

    pub fn output_dir_for(&self, job_id: Uuid) -> PathBuf {
        self.dirs.output_dir.join(job_id.to_string())
    }

    async fn fetch(&self, mut job: Job) -> Result<Job, StageError> {
        let local = self.scratch_path(&job)?;
        debug!(job_id = %job.id, source_ref = %job.source_ref, "Fetching input");
        self.transfer.download_to(&job.source_ref, &local).await?;

        job.local_input_path = Some(local);
        job.transition(Stage::Detecting)?;
        Ok(job)
    }

    async fn detect(&self, mut job: Job, deadline: &Deadline) -> Result<Job, StageError> {
        let input = job
            .local_input_path
            .clone()
            .ok_or_else(|| StageError::internal("detect stage reached without a fetched input"))?;
        let out_dir = self.output_dir_for(job.id);
        fs::create_dir_all(&out_dir)
            .await
            .map_err(|e| StageError::internal(format!("cannot create output dir: {e}")))?;
        let stem = source_stem(&job.source_ref);

        let (summary, output_path) = match job.media_kind {
            MediaKind::Image => {
                self.detect_image(&job, &input, &out_dir.join(format!("{stem}.jpg")), deadline)
                    .await?
            }
            MediaKind::Video => {
                self.detect_video(&job, &input, &out_dir.join(format!("{stem}.mp4")), deadline)
                    .await?
            }
        };

        info!(
            job_id = %job.id,
            classes = summary.len(),
            total = summary.values().map(|c| c.count).sum::<u32>(),
            "Detection complete"
        );

        let outcome = DetectOutcome::from_summary(summary, output_path.clone());
        if outcome.is_empty() {
            info!(job_id = %job.id, "No detections, chain will stop after cleanup");
        }
        job.local_output_path = Some(output_path);
        job.terminated = outcome.is_empty();
        job.detection = Some(outcome);
        job.transition(Stage::Publishing)?;
        Ok(job)
    }

    async fn detect_image(
        &self,
        job: &Job,
        input: &Path,
        output: &Path,
        deadline: &Deadline,
    ) -> Result<(DetectionSummary, PathBuf), StageError> {
        let mut image = load_image(input).await?;
        let detections = self.detector.infer(&image, job.class_filter.as_ref()).await?;
        deadline.check()?;
        let detections = apply_filter(detections, job.class_filter.as_ref());

        let summary = count_boxes(&detections, |id| self.detector.class_name(id));
        self.annotator
            .draw(&mut image, &detections, |d| self.detector.class_name(d.class_id));
        self.annotator.banner(&mut image, &summary);
        save_image(image, output).await?;
        Ok((summary, output.to_path_buf()))
    }

    /// Frames are processed strictly in order so track ids stay continuous.
    async fn detect_video(
        &self,
        job: &Job,
        input: &Path,
        output: &Path,
        deadline: &Deadline,
    ) -> Result<(DetectionSummary, PathBuf), StageError> {
        let (meta, mut reader) = self.codec.open(input).await?;
        let mut writer = self.codec.create(output, meta).await?;
        let mut session = TrackSession::new(job.id.to_string());
        let mut counter = TrackCounter::new();

        while let Some(mut frame) = reader.next_frame().await? {
            deadline.check()?;
            let detections = self
                .detector
                .track(&frame, job.class_filter.as_ref(), &mut session)
                .await?;
            let detections = apply_filter(detections, job.class_filter.as_ref());

            for det in &detections {
                counter.observe(&self.detector.class_name(det.class_id), det.class_id, det.track_id);
            }
            self.annotator.draw(&mut frame, &detections, |d| {
                track_caption(&self.detector.class_name(d.class_id), d.track_id)
            });
            self.annotator.banner(&mut frame, counter.summary());
            writer.write_frame(&frame).await?;
        }
        writer.finish().await?;

        debug!(job_id = %job.id, frames = session.frame_index, "Video processed");
        Ok((counter.into_summary(), output.to_path_buf()))
    }

    async fn publish(&self, mut job: Job, final_attempt: bool) -> Result<Job, StageError> {
        let upload = match &job.detection {
            Some(DetectOutcome::Detected { output_path, .. }) => {
                Some(self.transfer.upload(output_path, &self.output_prefix).await)
            }
            Some(DetectOutcome::Empty) => None,
            None => {
                self.cleanup(&job).await;
                return Err(StageError::internal("publish stage reached without a detect outcome"));
            }
        };

        if let Some(Err(e)) = &upload {
            if e.is_retryable() && !final_attempt {
                warn!(job_id = %job.id, error = %e, "Upload interrupted, keeping artifact for retry");
                return Err(StageError::retryable(ErrorKind::TransferError, e.to_string()));
            }
        }

        // Cleanup never masks the upload result.
        self.cleanup(&job).await;

        match upload {
            None => {
                job.transition(Stage::Stopped)?;
                Ok(job)
            }
            Some(Ok(key)) => {
                info!(job_id = %job.id, published_ref = %key, "Artifact published");
                job.published_ref = Some(key);
                job.transition(Stage::Completed)?;
                Ok(job)
            }
            Some(Err(e)) => Err(StageError::terminal(ErrorKind::TransferError, e.to_string())),
        }
    }

    /// Remove the job's input file, any partial fetch, any unfinished
    /// upload and the output directory. Failures are logged.
    pub async fn cleanup(&self, job: &Job) {
        if let Ok(scratch) = self.scratch_path(job) {
            if let Err(e) = self.transfer.discard_download(&job.source_ref, &scratch).await {
                warn!(job_id = %job.id, error = %e, "Cleanup failure: partial download");
            }
        }
        if let Some(input) = &job.local_input_path {
            if let Err(e) = fs::remove_file(input).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(job_id = %job.id, path = %input.display(), error = %e, "Cleanup failure: input file");
                }
            }
        }

        if let Some(DetectOutcome::Detected { output_path, .. }) = &job.detection {
            if let Err(e) = self.transfer.discard_upload(output_path, &self.output_prefix).await {
                warn!(job_id = %job.id, error = %e, "Cleanup failure: unfinished upload");
            }
        }

        let out_dir = job
            .local_output_path
            .as_deref()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.output_dir_for(job.id));
        if let Err(e) = fs::remove_dir_all(&out_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(job_id = %job.id, path = %out_dir.display(), error = %e, "Cleanup failure: output dir");
            }
        }
    }
}

fn apply_filter(detections: Vec<Detection>, filter: Option<&ClassFilter>) -> Vec<Detection> {
    match filter {
        Some(filter) => detections
            .into_iter()
            .filter(|d| filter.contains(&d.class_id))
            .collect(),
        None => detections,
    }
}

fn source_name(source_ref: &str) -> Option<&str> {
    source_ref.rsplit('/').next().filter(|n| !n.is_empty())
}

fn source_stem(source_ref: &str) -> String {
    source_name(source_ref)
        .map(Path::new)
        .and_then(Path::file_stem)
        .and_then(|s| s.to_str())
        .unwrap_or("output")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::detection::BoundingBox;

    #[test]
    fn test_source_stem() {
        assert_eq!(source_stem("clips/a.jpg"), "a");
        assert_eq!(source_stem("b.tar.mp4"), "b.tar");
        assert_eq!(source_stem("clips/"), "output");
    }

    #[test]
    fn test_filter_applies_uniformly() {
        let det = |class_id| Detection {
            class_id,
            confidence: 0.7,
            bbox: BoundingBox { x1: 0.0, y1: 0.0, x2: 1.0, y2: 1.0 },
            track_id: None,
        };
        let filter: ClassFilter = [2].into_iter().collect();
        let kept = apply_filter(vec![det(0), det(2), det(2)], Some(&filter));
        assert_eq!(kept.len(), 2);
        assert_eq!(apply_filter(vec![det(0)], None).len(), 1);
    }
}
