use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use tokio::time::Instant;

use crate::models::job::JobMessage;
use crate::services::retry::Retryable;

const QUEUE_KEY: &str = "label_pipeline:jobs";
const PROCESSING_KEY: &str = "label_pipeline:processing";
const DELAYED_KEY: &str = "label_pipeline:delayed";

/// Due delayed entries moved to the ready list per dequeue.
const PROMOTE_BATCH: isize = 100;

/// A message handed to a worker. Must be acknowledged once handled.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub message: JobMessage,
    receipt: String,
}

/// At-least-once work queue of [`JobMessage`]s.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, message: &JobMessage) -> Result<(), QueueError>;

    /// Make `message` visible after `delay`.
    async fn enqueue_delayed(&self, message: &JobMessage, delay: Duration) -> Result<(), QueueError>;

    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Ready messages, excluding delayed and in-flight ones.
    async fn depth(&self) -> Result<u64, QueueError>;

    /// Up to `limit` deliveries handed out but never acknowledged, oldest
    /// first. Includes those held by live workers.
    async fn unacked(&self, limit: usize) -> Result<Vec<Delivery>, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;
}

/// Redis-backed queue: a ready list, an in-flight list and a sorted set of
/// delayed messages scored by their ready-at time in milliseconds.
pub struct RedisJobQueue {
    client: redis::Client,
}

impl RedisJobQueue {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }

    /// Move due delayed messages onto the ready list. ZREM decides which
    /// caller owns each entry, so concurrent workers never double-push.
    async fn promote_due(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
    ) -> Result<(), QueueError> {
        let now_ms = Utc::now().timestamp_millis();
        let due: Vec<String> = conn
            .zrangebyscore_limit(DELAYED_KEY, "-inf", now_ms, 0, PROMOTE_BATCH)
            .await?;

        for payload in due {
            let removed: i64 = conn.zrem(DELAYED_KEY, &payload).await?;
            if removed == 1 {
                conn.lpush::<_, _, ()>(QUEUE_KEY, &payload).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, message: &JobMessage) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(message)?;
        conn.lpush::<_, _, ()>(QUEUE_KEY, &payload).await?;
        Ok(())
    }

    async fn enqueue_delayed(&self, message: &JobMessage, delay: Duration) -> Result<(), QueueError> {
        if delay.is_zero() {
            return self.enqueue(message).await;
        }

        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(message)?;
        let ready_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        conn.zadd::<_, _, _, ()>(DELAYED_KEY, &payload, ready_at).await?;
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.connection().await?;
        self.promote_due(&mut conn).await?;

        let result: Option<String> = conn.rpoplpush(QUEUE_KEY, PROCESSING_KEY).await?;

        match result {
            Some(payload) => {
                let message: JobMessage = serde_json::from_str(&payload)?;
                Ok(Some(Delivery {
                    message,
                    receipt: payload,
                }))
            }
            None => Ok(None),
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        conn.lrem::<_, _, ()>(PROCESSING_KEY, 1, &delivery.receipt).await?;
        Ok(())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let depth: u64 = conn.llen(QUEUE_KEY).await?;
        Ok(depth)
    }

    async fn unacked(&self, limit: usize) -> Result<Vec<Delivery>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connection().await?;
        // RPOPLPUSH pushes onto the head, so the oldest entries sit at the tail
        let start = -isize::try_from(limit).unwrap_or(isize::MAX);
        let payloads: Vec<String> = conn.lrange(PROCESSING_KEY, start, -1).await?;

        let mut deliveries = Vec::with_capacity(payloads.len());
        for payload in payloads.into_iter().rev() {
            match serde_json::from_str::<JobMessage>(&payload) {
                Ok(message) => deliveries.push(Delivery {
                    message,
                    receipt: payload,
                }),
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping unreadable in-flight entry");
                    conn.lrem::<_, _, ()>(PROCESSING_KEY, 1, &payload).await?;
                }
            }
        }
        Ok(deliveries)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct MemoryQueueState {
    ready: VecDeque<JobMessage>,
    delayed: Vec<(Instant, JobMessage)>,
    in_flight: HashMap<String, JobMessage>,
}

/// Process-local queue with the same delivery semantics as [`RedisJobQueue`].
#[derive(Default)]
pub struct InMemoryJobQueue {
    state: Mutex<MemoryQueueState>,
    next_receipt: AtomicU64,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages dequeued but not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        lock(&self.state).in_flight.len()
    }

    /// Messages waiting for their delay to pass.
    pub fn delayed(&self) -> usize {
        lock(&self.state).delayed.len()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, message: &JobMessage) -> Result<(), QueueError> {
        lock(&self.state).ready.push_back(message.clone());
        Ok(())
    }

    async fn enqueue_delayed(&self, message: &JobMessage, delay: Duration) -> Result<(), QueueError> {
        let mut state = lock(&self.state);
        if delay.is_zero() {
            state.ready.push_back(message.clone());
        } else {
            state.delayed.push((Instant::now() + delay, message.clone()));
        }
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError> {
        let mut state = lock(&self.state);

        let now = Instant::now();
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.delayed)
            .into_iter()
            .partition(|(ready_at, _)| *ready_at <= now);
        state.delayed = waiting;
        state.ready.extend(due.into_iter().map(|(_, message)| message));

        let Some(message) = state.ready.pop_front() else {
            return Ok(None);
        };
        let receipt = self.next_receipt.fetch_add(1, Ordering::Relaxed).to_string();
        state.in_flight.insert(receipt.clone(), message.clone());
        Ok(Some(Delivery { message, receipt }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        lock(&self.state).in_flight.remove(&delivery.receipt);
        Ok(())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        Ok(lock(&self.state).ready.len() as u64)
    }

    async fn unacked(&self, limit: usize) -> Result<Vec<Delivery>, QueueError> {
        let state = lock(&self.state);
        let mut deliveries: Vec<(u64, Delivery)> = state
            .in_flight
            .iter()
            .map(|(receipt, message)| {
                let order = receipt.parse().unwrap_or(u64::MAX);
                let delivery = Delivery {
                    message: message.clone(),
                    receipt: receipt.clone(),
                };
                (order, delivery)
            })
            .collect();
        deliveries.sort_by_key(|(order, _)| *order);
        Ok(deliveries
            .into_iter()
            .take(limit)
            .map(|(_, delivery)| delivery)
            .collect())
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

    #[error("Queue operation timed out after {0:?}")]
    Timeout(Duration),
}

impl Retryable for QueueError {
    fn is_retryable(&self) -> bool {
        !matches!(self, QueueError::Serialize(_))
    }

    fn timed_out(after: Duration) -> Self {
        QueueError::Timeout(after)
    }
}
