//! On-disk bookkeeping for resumable multipart transfers.
//!
//! A record is written when a chunked transfer starts, updated after every
//! part that lands, and deleted when the transfer succeeds. A crash leaves
//! the record behind so the next attempt can skip the parts it lists.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Download,
    Upload,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Download => "download",
            Direction::Upload => "upload",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferRecord {
    pub direction: Direction,
    pub remote_ref: String,
    pub local_path: PathBuf,
    pub size: u64,
    pub part_size: u64,
    /// Multipart upload session, uploads only.
    #[serde(default)]
    pub upload_id: Option<String>,
    /// Completed part numbers mapped to their etag (empty for downloads).
    #[serde(default)]
    pub completed: BTreeMap<u32, String>,
}

impl TransferRecord {
    pub fn new(
        direction: Direction,
        remote_ref: &str,
        local_path: &Path,
        size: u64,
        part_size: u64,
    ) -> Self {
        Self {
            direction,
            remote_ref: remote_ref.to_string(),
            local_path: local_path.to_path_buf(),
            size,
            part_size,
            upload_id: None,
            completed: BTreeMap::new(),
        }
    }

    /// Whether this record describes the same transfer and can be resumed.
    pub fn matches(&self, remote_ref: &str, local_path: &Path, size: u64, part_size: u64) -> bool {
        self.remote_ref == remote_ref
            && self.local_path == local_path
            && self.size == size
            && self.part_size == part_size
    }
}

/// A contiguous byte span of the object, numbered from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartSpan {
    pub number: u32,
    pub offset: u64,
    pub len: u64,
}

impl PartSpan {
    /// Inclusive last byte offset, as used by HTTP range requests.
    pub fn last_byte(&self) -> u64 {
        self.offset + self.len - 1
    }
}

/// Split `size` bytes into parts of at most `part_size`.
pub fn plan_parts(size: u64, part_size: u64) -> Vec<PartSpan> {
    let part_size = part_size.max(1);
    let mut parts = Vec::with_capacity(size.div_ceil(part_size) as usize);
    let mut offset = 0;
    let mut number = 1;
    while offset < size {
        let len = part_size.min(size - offset);
        parts.push(PartSpan {
            number,
            offset,
            len,
        });
        offset += len;
        number += 1;
    }
    parts
}

/// Directory of transfer records, one JSON file per transfer.
#[derive(Debug, Clone)]
pub struct RecordStore {
    dir: PathBuf,
}

impl RecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, direction: Direction, remote_ref: &str, local_path: &Path) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(direction.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(remote_ref.as_bytes());
        hasher.update(b"\n");
        hasher.update(local_path.to_string_lossy().as_bytes());
        self.dir.join(format!("{:x}.json", hasher.finalize()))
    }

    /// Load a record; unreadable or corrupt records are treated as absent.
    pub async fn load(
        &self,
        direction: Direction,
        remote_ref: &str,
        local_path: &Path,
    ) -> Option<TransferRecord> {
        let path = self.path_for(direction, remote_ref, local_path);
        let bytes = fs::read(&path).await.ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Discarding corrupt transfer record");
                None
            }
        }
    }

    /// Persist a record atomically (write to a temp file, then rename).
    pub async fn save(&self, record: &TransferRecord) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(record.direction, &record.remote_ref, &record.local_path);
        let tmp = path.with_extension("json.tmp");
        let payload = serde_json::to_vec(record).map_err(std::io::Error::other)?;
        fs::write(&tmp, payload).await?;
        fs::rename(&tmp, &path).await
    }

    pub async fn remove(&self, direction: Direction, remote_ref: &str, local_path: &Path) -> std::io::Result<()> {
        let path = self.path_for(direction, remote_ref, local_path);
        match fs::remove_file(&path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_parts_covers_object() {
        let parts = plan_parts(250, 100);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], PartSpan { number: 1, offset: 0, len: 100 });
        assert_eq!(parts[2], PartSpan { number: 3, offset: 200, len: 50 });
        assert_eq!(parts[2].last_byte(), 249);
        assert!(plan_parts(0, 100).is_empty());
    }

    #[test]
    fn test_record_match_requires_same_geometry() {
        let record = TransferRecord::new(Direction::Upload, "output/a.mp4", Path::new("/o/a.mp4"), 500, 100);
        assert!(record.matches("output/a.mp4", Path::new("/o/a.mp4"), 500, 100));
        assert!(!record.matches("output/a.mp4", Path::new("/o/a.mp4"), 501, 100));
        assert!(!record.matches("output/a.mp4", Path::new("/o/a.mp4"), 500, 64));
        assert!(!record.matches("output/b.mp4", Path::new("/o/a.mp4"), 500, 100));
    }

    #[tokio::test]
    async fn test_save_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());
        let local = Path::new("/scratch/a.mp4");

        let mut record = TransferRecord::new(Direction::Download, "clips/a.mp4", local, 300, 100);
        record.completed.insert(2, String::new());
        store.save(&record).await.unwrap();

        let loaded = store.load(Direction::Download, "clips/a.mp4", local).await.unwrap();
        assert_eq!(loaded, record);
        assert!(store.load(Direction::Upload, "clips/a.mp4", local).await.is_none());

        store.remove(Direction::Download, "clips/a.mp4", local).await.unwrap();
        assert!(store.load(Direction::Download, "clips/a.mp4", local).await.is_none());
        // removing twice is fine
        store.remove(Direction::Download, "clips/a.mp4", local).await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_record_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());
        let local = Path::new("/scratch/b.jpg");
        let path = store.path_for(Direction::Download, "b.jpg", local);
        tokio::fs::write(&path, b"{not json").await.unwrap();
        assert!(store.load(Direction::Download, "b.jpg", local).await.is_none());
    }
}
