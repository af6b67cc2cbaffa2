use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::pipeline::{PipelineConfig, WorkDirs};
use crate::services::transfer::TransferConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string for the job status store
    pub database_url: String,

    /// Redis connection string for the stage queue
    pub redis_url: String,

    /// Bucket holding inputs and published artifacts
    pub s3_bucket: String,

    /// S3-compatible endpoint URL
    pub s3_endpoint: String,

    #[serde(default = "default_region")]
    pub s3_region: String,

    pub s3_access_key: String,

    pub s3_secret_key: String,

    /// Base URL of the detection inference server
    pub detector_url: String,

    /// Webhook receiving success/failure notifications
    #[serde(default)]
    pub callback_url: Option<String>,

    /// Font used for box captions and the count banner; without one only
    /// box outlines are drawn
    #[serde(default)]
    pub annotation_font: Option<PathBuf>,

    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,

    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    #[serde(default = "default_transfer_record_dir")]
    pub transfer_record_dir: PathBuf,

    /// Remote prefix for published artifacts
    #[serde(default = "default_output_prefix")]
    pub output_prefix: String,

    #[serde(default = "default_part_size")]
    pub part_size: u64,

    #[serde(default = "default_part_size")]
    pub multipart_threshold: u64,

    #[serde(default = "default_transfer_concurrency")]
    pub transfer_concurrency: usize,

    #[serde(default = "default_part_retries")]
    pub part_retries: u32,

    /// Per-stage soft deadline (3 hours)
    #[serde(default = "default_soft_time_limit_secs")]
    pub soft_time_limit_secs: u64,

    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,

    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u32,

    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// Retention of terminal job records
    #[serde(default = "default_job_ttl_secs")]
    pub job_ttl_secs: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Prometheus scrape listener of the worker process
    #[serde(default = "default_worker_metrics_addr")]
    pub worker_metrics_addr: String,

    /// Names this worker's in-flight list; unique per worker process and
    /// stable across its restarts
    #[serde(default = "default_worker_id")]
    pub worker_id: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_region() -> String {
    "auto".to_string()
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from("tmp")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_transfer_record_dir() -> PathBuf {
    PathBuf::from("tmp/transfers")
}

fn default_output_prefix() -> String {
    "output".to_string()
}

fn default_part_size() -> u64 {
    100 * 1024
}

fn default_transfer_concurrency() -> usize {
    4
}

fn default_part_retries() -> u32 {
    3
}

fn default_soft_time_limit_secs() -> u64 {
    10_800
}

fn default_kill_grace_secs() -> u64 {
    30
}

fn default_max_redeliveries() -> u32 {
    3
}

fn default_max_concurrent_jobs() -> usize {
    2
}

fn default_job_ttl_secs() -> u64 {
    86_400
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_worker_metrics_addr() -> String {
    "0.0.0.0:9100".to_string()
}

fn default_worker_id() -> String {
    "worker-0".to_string()
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            part_size: self.part_size.max(1),
            multipart_threshold: self.multipart_threshold,
            concurrency: self.transfer_concurrency.max(1),
            part_retries: self.part_retries,
            record_dir: self.transfer_record_dir.clone(),
            ..TransferConfig::default()
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            soft_time_limit: Duration::from_secs(self.soft_time_limit_secs),
            kill_grace: Duration::from_secs(self.kill_grace_secs),
            max_redeliveries: self.max_redeliveries,
            output_prefix: self.output_prefix.clone(),
        }
    }

    pub fn work_dirs(&self) -> WorkDirs {
        WorkDirs {
            scratch_dir: self.scratch_dir.clone(),
            output_dir: self.output_dir.clone(),
        }
    }

    pub fn job_ttl(&self) -> Duration {
        Duration::from_secs(self.job_ttl_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
