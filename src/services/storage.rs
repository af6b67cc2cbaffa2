use async_trait::async_trait;
use s3::creds::Credentials;
use s3::serde_types::Part;
use s3::{Bucket, Region};

/// Metadata returned by a HEAD request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectMeta {
    pub size: u64,
}

/// A part accepted by a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Chunk-addressable object storage, keyed under a fixed bucket.
///
/// Implementations must be safe to call concurrently; the transfer engine
/// issues several ranged reads or part uploads for one object at once.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn head(&self, key: &str) -> Result<ObjectMeta, StorageError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Read bytes `start..=end` of an object.
    async fn get_range(&self, key: &str, start: u64, end: u64) -> Result<Vec<u8>, StorageError>;

    async fn put(&self, key: &str, data: Vec<u8>, content_type: &str) -> Result<(), StorageError>;

    /// Start a multipart upload and return its upload id.
    async fn create_multipart(&self, key: &str, content_type: &str) -> Result<String, StorageError>;

    async fn put_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Vec<u8>,
    ) -> Result<CompletedPart, StorageError>;

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<(), StorageError>;

    /// Abandon a multipart upload and release its stored parts.
    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Client for S3-compatible object storage (R2, OSS, MinIO, AWS).
pub struct S3Client {
    bucket: Box<Bucket>,
}

impl S3Client {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: region.to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self { bucket })
    }

    fn check(key: &str, code: u16) -> Result<(), StorageError> {
        match code {
            200..=299 => Ok(()),
            403 | 404 => Err(StorageError::NotFound(key.to_string())),
            code => Err(StorageError::Status {
                key: key.to_string(),
                code,
            }),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Client {
    async fn head(&self, key: &str) -> Result<ObjectMeta, StorageError> {
        let (head, code) = self.bucket.head_object(key).await?;
        Self::check(key, code)?;
        let size = head.content_length.unwrap_or(0).max(0) as u64;
        Ok(ObjectMeta { size })
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self.bucket.get_object(key).await?;
        Self::check(key, response.status_code())?;
        Ok(response.to_vec())
    }

    async fn get_range(&self, key: &str, start: u64, end: u64) -> Result<Vec<u8>, StorageError> {
        let response = self.bucket.get_object_range(key, start, Some(end)).await?;
        Self::check(key, response.status_code())?;
        Ok(response.to_vec())
    }

    async fn put(&self, key: &str, data: Vec<u8>, content_type: &str) -> Result<(), StorageError> {
        let response = self
            .bucket
            .put_object_with_content_type(key, &data, content_type)
            .await?;
        Self::check(key, response.status_code())
    }

    async fn create_multipart(&self, key: &str, content_type: &str) -> Result<String, StorageError> {
        let response = self
            .bucket
            .initiate_multipart_upload(key, content_type)
            .await?;
        Ok(response.upload_id)
    }

    async fn put_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Vec<u8>,
    ) -> Result<CompletedPart, StorageError> {
        let part = self
            .bucket
            .put_multipart_chunk(data, key, part_number, upload_id, "application/octet-stream")
            .await?;
        Ok(CompletedPart {
            part_number: part.part_number,
            etag: part.etag,
        })
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<(), StorageError> {
        let parts = parts
            .into_iter()
            .map(|p| Part {
                part_number: p.part_number,
                etag: p.etag,
            })
            .collect();
        let response = self
            .bucket
            .complete_multipart_upload(key, upload_id, parts)
            .await?;
        Self::check(key, response.status_code())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), StorageError> {
        self.bucket.abort_upload(key, upload_id).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let response = self.bucket.delete_object(key).await?;
        Self::check(key, response.status_code())
    }
}

/// Content type for an uploaded artifact, derived from its extension.
pub fn content_type_for(path: &std::path::Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("mp4") => "video/mp4",
        _ => "application/octet-stream",
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Object not found or not accessible: {0}")]
    NotFound(String),

    #[error("Storage returned HTTP {code} for {key}")]
    Status { key: String, code: u16 },

    #[error("Storage configuration error: {0}")]
    Config(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}
