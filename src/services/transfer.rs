//! Chunked, resumable transfers between local files and object storage.
//!
//! Objects below `multipart_threshold` move in a single request. Larger ones
//! are split into `part_size` parts moved by up to `concurrency` concurrent
//! requests, with progress kept in a [`TransferRecord`] so a failed transfer
//! resumes from the parts already done instead of starting over.

use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, TryStreamExt};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::services::storage::{content_type_for, CompletedPart, ObjectStore, StorageError};
use crate::services::transfer_record::{plan_parts, Direction, PartSpan, RecordStore, TransferRecord};

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub part_size: u64,
    /// Objects smaller than this are moved in one request.
    pub multipart_threshold: u64,
    /// Parts in flight per transfer.
    pub concurrency: usize,
    /// Retries per request before the whole transfer fails.
    pub part_retries: u32,
    pub retry_backoff: Duration,
    pub record_dir: PathBuf,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            part_size: 100 * 1024,
            multipart_threshold: 100 * 1024,
            concurrency: 4,
            part_retries: 3,
            retry_backoff: Duration::from_millis(200),
            record_dir: PathBuf::from("tmp/transfers"),
        }
    }
}

pub struct TransferEngine {
    store: Arc<dyn ObjectStore>,
    records: RecordStore,
    config: TransferConfig,
}

impl TransferEngine {
    pub fn new(store: Arc<dyn ObjectStore>, config: TransferConfig) -> Self {
        Self {
            records: RecordStore::new(config.record_dir.clone()),
            store,
            config,
        }
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    /// Download `remote_ref` into `local_dir`, keeping the object's base name.
    pub async fn download(&self, remote_ref: &str, local_dir: &Path) -> Result<PathBuf, TransferError> {
        let name = remote_file_name(remote_ref)?;
        let local_path = local_dir.join(name);
        self.download_to(remote_ref, &local_path).await?;
        Ok(local_path)
    }

    /// Download `remote_ref` to exactly `local_path`.
    pub async fn download_to(&self, remote_ref: &str, local_path: &Path) -> Result<(), TransferError> {
        if let Some(parent) = local_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let meta = self.with_retries(|| self.store.head(remote_ref)).await?;

        if meta.size < self.config.multipart_threshold {
            debug!(remote_ref, size = meta.size, "Downloading object in one request");
            let bytes = self.with_retries(|| self.store.get(remote_ref)).await?;
            let tmp = partial_path(local_path);
            fs::write(&tmp, &bytes).await?;
            fs::rename(&tmp, local_path).await?;
            return Ok(());
        }

        self.download_parts(remote_ref, local_path, meta.size).await
    }

    async fn download_parts(&self, remote_ref: &str, local_path: &Path, size: u64) -> Result<(), TransferError> {
        let part_size = self.config.part_size;
        let part_path = partial_path(local_path);

        let existing = self
            .records
            .load(Direction::Download, remote_ref, local_path)
            .await
            .filter(|r| r.matches(remote_ref, local_path, size, part_size));

        let partial_len = file_len(&part_path).await;
        let record = match existing {
            Some(record) if partial_len == Some(size) => {
                info!(
                    remote_ref,
                    completed_parts = record.completed.len(),
                    "Resuming download"
                );
                record
            }
            _ => {
                let file = fs::File::create(&part_path).await?;
                file.set_len(size).await?;
                TransferRecord::new(Direction::Download, remote_ref, local_path, size, part_size)
            }
        };
        self.records.save(&record).await?;

        let pending: Vec<PartSpan> = plan_parts(size, part_size)
            .into_iter()
            .filter(|p| !record.completed.contains_key(&p.number))
            .collect();
        debug!(remote_ref, pending = pending.len(), "Downloading parts");

        let record = Mutex::new(record);
        stream::iter(pending.into_iter().map(Ok::<_, TransferError>))
            .try_for_each_concurrent(self.config.concurrency, |part| {
                let record = &record;
                let part_path = &part_path;
                async move {
                    let bytes = self
                        .with_retries(|| self.store.get_range(remote_ref, part.offset, part.last_byte()))
                        .await?;
                    if bytes.len() as u64 != part.len {
                        return Err(TransferError::ShortRead {
                            part: part.number,
                            expected: part.len,
                            actual: bytes.len() as u64,
                        });
                    }
                    write_at(part_path, part.offset, &bytes).await?;

                    let mut record = record.lock().await;
                    record.completed.insert(part.number, String::new());
                    self.records.save(&record).await?;
                    Ok(())
                }
            })
            .await?;

        fs::rename(&part_path, local_path).await?;
        self.records
            .remove(Direction::Download, remote_ref, local_path)
            .await?;
        info!(remote_ref, size, "Download complete");
        Ok(())
    }

    /// Drop a partial download and its resume record.
    pub async fn discard_download(&self, remote_ref: &str, local_path: &Path) -> Result<(), TransferError> {
        match fs::remove_file(partial_path(local_path)).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        self.records
            .remove(Direction::Download, remote_ref, local_path)
            .await?;
        Ok(())
    }

    /// Abort an unfinished multipart upload of `local_path` under
    /// `remote_prefix` and drop its resume record.
    pub async fn discard_upload(&self, local_path: &Path, remote_prefix: &str) -> Result<(), TransferError> {
        let Some(name) = local_path.file_name().and_then(|n| n.to_str()) else {
            return Ok(());
        };
        let key = join_key(remote_prefix, name);
        let Some(record) = self.records.load(Direction::Upload, &key, local_path).await else {
            return Ok(());
        };
        if let Some(upload_id) = &record.upload_id {
            debug!(key = %key, upload_id = %upload_id, "Aborting multipart upload");
            if let Err(e) = self.with_retries(|| self.store.abort_multipart(&key, upload_id)).await {
                if !e.is_not_found() {
                    return Err(e.into());
                }
            }
        }
        self.records.remove(Direction::Upload, &key, local_path).await?;
        Ok(())
    }

    /// Upload `local_path` under `remote_prefix`, returning the object key.
    pub async fn upload(&self, local_path: &Path, remote_prefix: &str) -> Result<String, TransferError> {
        let name = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| TransferError::InvalidPath(local_path.display().to_string()))?;
        let key = join_key(remote_prefix, name);
        self.upload_to(local_path, &key).await?;
        Ok(key)
    }

    pub async fn upload_to(&self, local_path: &Path, key: &str) -> Result<(), TransferError> {
        let size = fs::metadata(local_path).await?.len();
        let content_type = content_type_for(local_path);

        if size < self.config.multipart_threshold {
            debug!(key, size, "Uploading object in one request");
            let data = fs::read(local_path).await?;
            self.with_retries(|| self.store.put(key, data.clone(), content_type))
                .await?;
            return Ok(());
        }

        let part_size = self.config.part_size;
        let existing = self
            .records
            .load(Direction::Upload, key, local_path)
            .await
            .filter(|r| r.matches(key, local_path, size, part_size));

        let (record, upload_id) = match existing {
            Some(record) if record.upload_id.is_some() => {
                info!(key, completed_parts = record.completed.len(), "Resuming upload");
                let upload_id = record.upload_id.clone().unwrap_or_default();
                (record, upload_id)
            }
            _ => {
                let upload_id = self
                    .with_retries(|| self.store.create_multipart(key, content_type))
                    .await?;
                let mut record = TransferRecord::new(Direction::Upload, key, local_path, size, part_size);
                record.upload_id = Some(upload_id.clone());
                (record, upload_id)
            }
        };
        self.records.save(&record).await?;

        let pending: Vec<PartSpan> = plan_parts(size, part_size)
            .into_iter()
            .filter(|p| !record.completed.contains_key(&p.number))
            .collect();
        debug!(key, pending = pending.len(), "Uploading parts");

        let record = Mutex::new(record);
        stream::iter(pending.into_iter().map(Ok::<_, TransferError>))
            .try_for_each_concurrent(self.config.concurrency, |part| {
                let record = &record;
                let upload_id = upload_id.as_str();
                async move {
                    let data = read_at(local_path, part.offset, part.len).await?;
                    let done = self
                        .with_retries(|| self.store.put_part(key, upload_id, part.number, data.clone()))
                        .await?;

                    let mut record = record.lock().await;
                    record.completed.insert(part.number, done.etag);
                    self.records.save(&record).await?;
                    Ok(())
                }
            })
            .await?;

        let parts: Vec<CompletedPart> = record
            .into_inner()
            .completed
            .into_iter()
            .map(|(part_number, etag)| CompletedPart { part_number, etag })
            .collect();
        self.with_retries(|| self.store.complete_multipart(key, &upload_id, parts.clone()))
            .await?;
        self.records.remove(Direction::Upload, key, local_path).await?;
        info!(key, size, "Upload complete");
        Ok(())
    }

    /// Run one storage request, retrying transient failures with backoff.
    async fn with_retries<T, F, Fut>(&self, mut op: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_not_found() || attempt >= self.config.part_retries => return Err(e),
                Err(e) => {
                    attempt += 1;
                    warn!(attempt, error = %e, "Storage request failed, retrying");
                    tokio::time::sleep(self.config.retry_backoff * attempt).await;
                }
            }
        }
    }
}

fn remote_file_name(remote_ref: &str) -> Result<&str, TransferError> {
    remote_ref
        .rsplit('/')
        .next()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| TransferError::InvalidPath(remote_ref.to_string()))
}

pub(crate) fn join_key(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

fn partial_path(local_path: &Path) -> PathBuf {
    let mut name = local_path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

async fn file_len(path: &Path) -> Option<u64> {
    fs::metadata(path).await.ok().map(|m| m.len())
}

async fn write_at(path: &Path, offset: u64, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new().write(true).open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(bytes).await?;
    file.flush().await
}

async fn read_at(path: &Path, offset: u64, len: u64) -> std::io::Result<Vec<u8>> {
    let mut file = fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("Remote object not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(StorageError),

    #[error("Local I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Short read for part {part}: expected {expected} bytes, got {actual}")]
    ShortRead { part: u32, expected: u64, actual: u64 },

    #[error("Invalid transfer path: {0}")]
    InvalidPath(String),
}

impl From<StorageError> for TransferError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(key) => TransferError::NotFound(key),
            other => TransferError::Storage(other),
        }
    }
}

impl TransferError {
    /// Whether re-invoking the transfer may succeed and will resume.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransferError::NotFound(_) | TransferError::InvalidPath(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_key() {
        assert_eq!(join_key("output", "a.jpg"), "output/a.jpg");
        assert_eq!(join_key("output/", "a.jpg"), "output/a.jpg");
        assert_eq!(join_key("", "a.jpg"), "a.jpg");
    }

    #[test]
    fn test_remote_file_name() {
        assert_eq!(remote_file_name("clips/a.jpg").unwrap(), "a.jpg");
        assert_eq!(remote_file_name("a.jpg").unwrap(), "a.jpg");
        assert!(remote_file_name("clips/").is_err());
    }

    #[test]
    fn test_partial_path_appends_suffix() {
        assert_eq!(partial_path(Path::new("/tmp/a.mp4")), PathBuf::from("/tmp/a.mp4.part"));
    }

    #[test]
    fn test_not_found_is_terminal() {
        let err: TransferError = StorageError::NotFound("k".to_string()).into();
        assert!(!err.is_retryable());
        let err: TransferError = StorageError::Status { key: "k".to_string(), code: 500 }.into();
        assert!(err.is_retryable());
    }
}
