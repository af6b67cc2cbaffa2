use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::queries;
use crate::models::job::{Job, Stage};

/// Durable mapping job id → job record, polled by the API layer.
///
/// Many readers may poll concurrently; writes for one job are serialized by
/// the queue, and `compare_and_set` turns that into a checked invariant so a
/// redelivered message cannot overwrite progress it did not observe.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: &Job) -> Result<(), StoreError>;

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Store `job` only if the stored stage equals `expected`.
    async fn compare_and_set(&self, job_id: Uuid, expected: Stage, job: &Job) -> Result<bool, StoreError>;

    /// Drop terminal records older than `ttl`. Returns how many were removed.
    async fn evict_expired(&self, ttl: Duration) -> Result<u64, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

struct Entry {
    job: Job,
    finished_at: Option<Instant>,
}

/// In-process store for single-process deployments and tests.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Entry>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::Duplicate(job.id));
        }
        jobs.insert(
            job.id,
            Entry {
                job: job.clone(),
                finished_at: job.stage.is_terminal().then(Instant::now),
            },
        );
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().await.get(&job_id).map(|e| e.job.clone()))
    }

    async fn compare_and_set(&self, job_id: Uuid, expected: Stage, job: &Job) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job_id) {
            Some(entry) if entry.job.stage == expected => {
                entry.job = job.clone();
                if job.stage.is_terminal() {
                    entry.finished_at = Some(Instant::now());
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn evict_expired(&self, ttl: Duration) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, e| e.finished_at.map_or(true, |at| at.elapsed() < ttl));
        Ok((before - jobs.len()) as u64)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// PostgreSQL-backed store shared by the API and worker processes.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        if queries::insert_job(&self.pool, job).await? {
            Ok(())
        } else {
            Err(StoreError::Duplicate(job.id))
        }
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(queries::get_job(&self.pool, job_id).await?)
    }

    async fn compare_and_set(&self, job_id: Uuid, expected: Stage, job: &Job) -> Result<bool, StoreError> {
        Ok(queries::compare_and_set_job(&self.pool, job_id, &expected.to_string(), job).await?)
    }

    async fn evict_expired(&self, ttl: Duration) -> Result<u64, StoreError> {
        Ok(queries::delete_finished_before(&self.pool, ttl.as_secs() as i64).await?)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Job already exists: {0}")]
    Duplicate(Uuid),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::MediaKind;

    fn job() -> Job {
        Job::new("clips/a.jpg".to_string(), MediaKind::Image, None)
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = MemoryJobStore::new();
        let job = job();
        store.create(&job).await.unwrap();
        assert_eq!(store.get(job.id).await.unwrap(), Some(job.clone()));
        assert!(matches!(store.create(&job).await, Err(StoreError::Duplicate(_))));
        assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_compare_and_set_rejects_stale_stage() {
        let store = MemoryJobStore::new();
        let mut job = job();
        store.create(&job).await.unwrap();

        job.transition(Stage::Detecting).unwrap();
        assert!(store.compare_and_set(job.id, Stage::Fetching, &job).await.unwrap());

        // A redelivered fetch message still expects Fetching.
        let mut stale = job.clone();
        stale.stage = Stage::Detecting;
        assert!(!store.compare_and_set(job.id, Stage::Fetching, &stale).await.unwrap());
        assert_eq!(store.get(job.id).await.unwrap().unwrap().stage, Stage::Detecting);
    }

    #[tokio::test]
    async fn test_only_terminal_jobs_are_evicted() {
        let store = MemoryJobStore::new();
        let running = job();
        let mut done = job();
        store.create(&running).await.unwrap();
        store.create(&done).await.unwrap();

        let expected = done.stage;
        done.transition(Stage::Stopped).unwrap();
        store.compare_and_set(done.id, expected, &done).await.unwrap();

        assert_eq!(store.evict_expired(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(store.evict_expired(Duration::ZERO).await.unwrap(), 1);
        assert!(store.get(done.id).await.unwrap().is_none());
        assert!(store.get(running.id).await.unwrap().is_some());
    }
}
