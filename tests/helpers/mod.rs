//! In-process fakes for the pipeline's collaborators.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use detect_pipeline::models::detection::{BoundingBox, Detection};
use detect_pipeline::models::job::ClassFilter;
use detect_pipeline::pipeline::{PipelineConfig, StageExecutor, StageWorkers, Submitter, WorkDirs};
use detect_pipeline::services::detector::{coco_label, Detector, DetectorError, TrackSession};
use detect_pipeline::services::job_store::MemoryJobStore;
use detect_pipeline::services::media::{FrameReader, FrameWriter, MediaError, VideoCodec, VideoMeta};
use detect_pipeline::services::notify::Notifier;
use detect_pipeline::services::queue::MemoryStageQueue;
use detect_pipeline::services::storage::{CompletedPart, ObjectMeta, ObjectStore, StorageError};
use detect_pipeline::services::transfer::{TransferConfig, TransferEngine};
use image::{DynamicImage, ImageFormat, RgbImage};
use tempfile::TempDir;

/// Object store held in memory, with request counters and injectable faults.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    uploads: Mutex<HashMap<String, (String, BTreeMap<u32, Vec<u8>>)>>,
    next_upload: AtomicUsize,
    fail_ranges_from: Mutex<Option<u64>>,
    fail_parts_from: Mutex<Option<u32>>,
    fail_puts: AtomicBool,
    pub gets: AtomicUsize,
    pub range_gets: AtomicUsize,
    pub puts: AtomicUsize,
    pub part_puts: AtomicUsize,
    pub multipart_creates: AtomicUsize,
    pub aborts: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: &str, data: Vec<u8>) {
        self.objects.lock().unwrap().insert(key.to_string(), data);
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Ranged reads starting at or after `offset` fail until cleared.
    pub fn fail_ranges_from(&self, offset: Option<u64>) {
        *self.fail_ranges_from.lock().unwrap() = offset;
    }

    /// Part uploads numbered `part` or above fail until cleared.
    pub fn fail_parts_from(&self, part: Option<u32>) {
        *self.fail_parts_from.lock().unwrap() = part;
    }

    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Multipart uploads started but neither completed nor aborted.
    pub fn open_uploads(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn unavailable(key: &str) -> StorageError {
        StorageError::Status {
            key: key.to_string(),
            code: 503,
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn head(&self, key: &str) -> Result<ObjectMeta, StorageError> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .map(|data| ObjectMeta { size: data.len() as u64 })
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.object(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn get_range(&self, key: &str, start: u64, end: u64) -> Result<Vec<u8>, StorageError> {
        self.range_gets.fetch_add(1, Ordering::SeqCst);
        if let Some(from) = *self.fail_ranges_from.lock().unwrap() {
            if start >= from {
                return Err(Self::unavailable(key));
            }
        }
        let data = self
            .object(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        let end = (end as usize).min(data.len() - 1);
        Ok(data[start as usize..=end].to_vec())
    }

    async fn put(&self, key: &str, data: Vec<u8>, _content_type: &str) -> Result<(), StorageError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(Self::unavailable(key));
        }
        self.insert(key, data);
        Ok(())
    }

    async fn create_multipart(&self, key: &str, _content_type: &str) -> Result<String, StorageError> {
        self.multipart_creates.fetch_add(1, Ordering::SeqCst);
        let id = format!("upload-{}", self.next_upload.fetch_add(1, Ordering::SeqCst));
        self.uploads
            .lock()
            .unwrap()
            .insert(id.clone(), (key.to_string(), BTreeMap::new()));
        Ok(id)
    }

    async fn put_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Vec<u8>,
    ) -> Result<CompletedPart, StorageError> {
        self.part_puts.fetch_add(1, Ordering::SeqCst);
        if let Some(from) = *self.fail_parts_from.lock().unwrap() {
            if part_number >= from {
                return Err(Self::unavailable(key));
            }
        }
        let mut uploads = self.uploads.lock().unwrap();
        let (_, parts) = uploads
            .get_mut(upload_id)
            .ok_or_else(|| StorageError::NotFound(upload_id.to_string()))?;
        parts.insert(part_number, data);
        Ok(CompletedPart {
            part_number,
            etag: format!("etag-{part_number}"),
        })
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<(), StorageError> {
        let (_, stored) = self
            .uploads
            .lock()
            .unwrap()
            .remove(upload_id)
            .ok_or_else(|| StorageError::NotFound(upload_id.to_string()))?;
        let mut body = Vec::new();
        for part in parts {
            let chunk = stored
                .get(&part.part_number)
                .ok_or_else(|| StorageError::NotFound(format!("{upload_id}#{}", part.part_number)))?;
            body.extend_from_slice(chunk);
        }
        self.insert(key, body);
        Ok(())
    }

    async fn abort_multipart(&self, _key: &str, upload_id: &str) -> Result<(), StorageError> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        self.uploads
            .lock()
            .unwrap()
            .remove(upload_id)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(upload_id.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }
}

pub fn boxed(class_id: u32, track_id: Option<u64>) -> Detection {
    Detection {
        class_id,
        confidence: 0.9,
        bbox: BoundingBox {
            x1: 1.0,
            y1: 1.0,
            x2: 6.0,
            y2: 6.0,
        },
        track_id,
    }
}

/// Detector returning scripted results.
#[derive(Default)]
pub struct StubDetector {
    pub image_detections: Vec<Detection>,
    /// Tracker output per frame index; frames past the end detect nothing.
    pub frames: Vec<Vec<Detection>>,
    /// Sleep applied to every call.
    pub delay: Option<Duration>,
    pub calls: AtomicUsize,
}

#[async_trait]
impl Detector for StubDetector {
    fn class_name(&self, class_id: u32) -> String {
        coco_label(class_id)
    }

    async fn infer(
        &self,
        _image: &RgbImage,
        _class_filter: Option<&ClassFilter>,
    ) -> Result<Vec<Detection>, DetectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.image_detections.clone())
    }

    async fn track(
        &self,
        _frame: &RgbImage,
        _class_filter: Option<&ClassFilter>,
        session: &mut TrackSession,
    ) -> Result<Vec<Detection>, DetectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let detections = self
            .frames
            .get(session.frame_index as usize)
            .cloned()
            .unwrap_or_default();
        session.frame_index += 1;
        Ok(detections)
    }
}

/// Codec yielding blank frames and writing a placeholder file on finish.
pub struct StubCodec {
    pub frames: usize,
}

struct StubReader {
    remaining: usize,
}

#[async_trait]
impl FrameReader for StubReader {
    async fn next_frame(&mut self) -> Result<Option<RgbImage>, MediaError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        Ok(Some(RgbImage::new(8, 8)))
    }
}

struct StubWriter {
    path: PathBuf,
    written: usize,
}

#[async_trait]
impl FrameWriter for StubWriter {
    async fn write_frame(&mut self, _frame: &RgbImage) -> Result<(), MediaError> {
        self.written += 1;
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<(), MediaError> {
        tokio::fs::write(&self.path, format!("frames={}", self.written)).await?;
        Ok(())
    }
}

#[async_trait]
impl VideoCodec for StubCodec {
    async fn open(&self, path: &Path) -> Result<(VideoMeta, Box<dyn FrameReader>), MediaError> {
        tokio::fs::metadata(path).await?;
        let meta = VideoMeta {
            width: 8,
            height: 8,
            fps: 25.0,
        };
        Ok((meta, Box::new(StubReader { remaining: self.frames })))
    }

    async fn create(&self, path: &Path, _meta: VideoMeta) -> Result<Box<dyn FrameWriter>, MediaError> {
        Ok(Box::new(StubWriter {
            path: path.to_path_buf(),
            written: 0,
        }))
    }
}

pub fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(RgbImage::new(width, height))
        .write_to(&mut buf, ImageFormat::Jpeg)
        .unwrap();
    buf.into_inner()
}

/// Transfer settings with tiny parts and no retry delay.
pub fn transfer_config(record_dir: &Path) -> TransferConfig {
    TransferConfig {
        part_size: 64,
        multipart_threshold: 256,
        concurrency: 1,
        part_retries: 0,
        retry_backoff: Duration::from_millis(1),
        record_dir: record_dir.to_path_buf(),
    }
}

/// A complete in-process pipeline rooted in a temp directory.
pub struct Harness {
    pub dir: TempDir,
    pub objects: Arc<MemoryObjectStore>,
    pub store: Arc<MemoryJobStore>,
    pub queue: Arc<MemoryStageQueue>,
    pub submitter: Submitter,
    pub executor: StageExecutor,
    pub detector: Arc<StubDetector>,
}

impl Harness {
    pub fn new(detector: StubDetector) -> Self {
        Self::with(detector, StubCodec { frames: 0 }, PipelineConfig::default(), Notifier::disabled())
    }

    pub fn with(
        detector: StubDetector,
        codec: StubCodec,
        config: PipelineConfig,
        notifier: Notifier,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let objects = Arc::new(MemoryObjectStore::new());
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(MemoryStageQueue::new());
        let detector = Arc::new(detector);

        let transfer = TransferEngine::new(objects.clone(), transfer_config(&dir.path().join("records")));
        let workers = StageWorkers::new(
            transfer,
            detector.clone(),
            Arc::new(codec),
            WorkDirs {
                scratch_dir: dir.path().join("tmp"),
                output_dir: dir.path().join("output"),
            },
            config.output_prefix.clone(),
        );
        let executor = StageExecutor::new(store.clone(), queue.clone(), Arc::new(workers), notifier, config);

        Self {
            submitter: Submitter::new(store.clone(), queue.clone()),
            dir,
            objects,
            store,
            queue,
            executor,
            detector,
        }
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.dir.path().join("tmp")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.dir.path().join("output")
    }

    /// Transfer records still on disk.
    pub fn leftover_records(&self) -> usize {
        std::fs::read_dir(self.dir.path().join("records"))
            .map(|entries| entries.flatten().count())
            .unwrap_or(0)
    }

    /// Number of files left under the scratch and output dirs.
    pub fn leftover_files(&self) -> usize {
        fn walk(path: &Path) -> usize {
            match std::fs::read_dir(path) {
                Ok(entries) => entries
                    .flatten()
                    .map(|e| {
                        let p = e.path();
                        if p.is_dir() {
                            walk(&p)
                        } else {
                            1
                        }
                    })
                    .sum(),
                Err(_) => 0,
            }
        }
        walk(&self.scratch_dir()) + walk(&self.output_dir())
    }
}
