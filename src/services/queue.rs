use std::collections::VecDeque;

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::models::job::Job;

const QUEUE_KEY: &str = "detect_pipeline:stages";
const PROCESSING_PREFIX: &str = "detect_pipeline:processing";

/// In-flight list owned by one consumer.
fn processing_key(consumer_id: &str) -> String {
    format!("{PROCESSING_PREFIX}:{consumer_id}")
}

/// Stage payload: the job snapshot the stage operates on.
///
/// The stage to run is `job.stage`; `attempt` counts stage-level retries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageMessage {
    pub job: Job,
    #[serde(default)]
    pub attempt: u32,
}

impl StageMessage {
    pub fn new(job: Job) -> Self {
        Self { job, attempt: 0 }
    }

    pub fn retry(&self) -> Self {
        Self {
            job: self.job.clone(),
            attempt: self.attempt + 1,
        }
    }
}

/// A message handed to exactly one consumer until acked or nacked.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: StageMessage,
    raw: String,
}

/// Durable queue carrying stage messages between workers.
///
/// A received message stays invisible to other consumers until `ack`
/// (done) or `nack` (back to pending). A consumer that restarts after a
/// crash returns its own stranded messages to pending with
/// `recover_in_flight`; messages held by other consumers are untouched.
#[async_trait]
pub trait StageQueue: Send + Sync {
    async fn dispatch(&self, message: &StageMessage) -> Result<(), QueueError>;

    async fn receive(&self) -> Result<Option<Delivery>, QueueError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    async fn nack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Move this consumer's messages left in flight back to pending.
    /// Returns how many moved.
    async fn recover_in_flight(&self) -> Result<u64, QueueError>;

    /// Number of pending messages.
    async fn depth(&self) -> Result<u64, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;
}

/// Redis-backed queue using the reliable-list pattern.
///
/// Each consumer moves received messages into its own processing list, so
/// `consumer_id` must be unique per worker process and stable across its
/// restarts.
pub struct RedisStageQueue {
    client: redis::Client,
    processing_key: String,
}

impl RedisStageQueue {
    pub fn new(redis_url: &str, consumer_id: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self {
            client,
            processing_key: processing_key(consumer_id),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }
}

#[async_trait]
impl StageQueue for RedisStageQueue {
    async fn dispatch(&self, message: &StageMessage) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(message)?;
        conn.lpush::<_, _, ()>(QUEUE_KEY, &payload).await?;
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.connection().await?;
        let result: Option<String> = conn.rpoplpush(QUEUE_KEY, &self.processing_key).await?;

        match result {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(message) => Ok(Some(Delivery { message, raw })),
                Err(e) => {
                    // Unparseable payloads would otherwise be redelivered forever.
                    conn.lrem::<_, _, ()>(&self.processing_key, 1, &raw).await?;
                    Err(QueueError::Serialize(e))
                }
            },
            None => Ok(None),
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        conn.lrem::<_, _, ()>(&self.processing_key, 1, &delivery.raw).await?;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::pipe()
            .atomic()
            .lrem(&self.processing_key, 1, &delivery.raw)
            .ignore()
            .lpush(QUEUE_KEY, &delivery.raw)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn recover_in_flight(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let mut moved = 0;
        loop {
            let item: Option<String> = conn.rpoplpush(&self.processing_key, QUEUE_KEY).await?;
            if item.is_none() {
                break;
            }
            moved += 1;
        }
        Ok(moved)
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let depth: u64 = conn.llen(QUEUE_KEY).await?;
        Ok(depth)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}

#[derive(Default)]
struct MemoryLists {
    pending: VecDeque<String>,
    processing: Vec<String>,
}

/// In-process queue with the same delivery contract as the Redis queue.
#[derive(Default)]
pub struct MemoryStageQueue {
    lists: Mutex<MemoryLists>,
}

impl MemoryStageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn in_flight(&self) -> usize {
        self.lists.lock().await.processing.len()
    }
}

#[async_trait]
impl StageQueue for MemoryStageQueue {
    async fn dispatch(&self, message: &StageMessage) -> Result<(), QueueError> {
        let payload = serde_json::to_string(message)?;
        self.lists.lock().await.pending.push_back(payload);
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>, QueueError> {
        let mut lists = self.lists.lock().await;
        let Some(raw) = lists.pending.pop_front() else {
            return Ok(None);
        };
        let message = serde_json::from_str(&raw)?;
        lists.processing.push(raw.clone());
        Ok(Some(Delivery { message, raw }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut lists = self.lists.lock().await;
        if let Some(pos) = lists.processing.iter().position(|r| *r == delivery.raw) {
            lists.processing.remove(pos);
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut lists = self.lists.lock().await;
        if let Some(pos) = lists.processing.iter().position(|r| *r == delivery.raw) {
            let raw = lists.processing.remove(pos);
            lists.pending.push_back(raw);
        }
        Ok(())
    }

    async fn recover_in_flight(&self) -> Result<u64, QueueError> {
        let mut lists = self.lists.lock().await;
        let stranded: Vec<String> = lists.processing.drain(..).collect();
        let moved = stranded.len() as u64;
        lists.pending.extend(stranded);
        Ok(moved)
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        Ok(self.lists.lock().await.pending.len() as u64)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
