//! In-process broker with lease semantics, for local runs and tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::debug;

use mazepa_core::QueueError;

use crate::broker::{MessageBroker, QueueHealth, QueueMessage};

struct StoredMessage {
    id: String,
    body: String,
    sent_at: DateTime<Utc>,
    receive_count: u32,
    visible_at: Instant,
    receipt_handle: Option<String>,
}

/// Named FIFO queues held in memory.
///
/// Received messages are hidden until their lease expires or they are
/// nacked; acking requires the receipt handle of the current lease.
#[derive(Default)]
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, VecDeque<StoredMessage>>>,
    next_id: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queues<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let broker = Self::new();
        for name in names {
            broker.create_queue(name);
        }
        broker
    }

    /// Create `name` if it does not exist yet.
    pub fn create_queue(&self, name: impl Into<String>) {
        self.lock().entry(name.into()).or_default();
    }

    pub fn delete_queue(&self, name: &str) -> bool {
        self.lock().remove(name).is_some()
    }

    /// Messages currently visible in `queue`.
    pub fn visible_len(&self, queue: &str) -> usize {
        let now = Instant::now();
        self.lock()
            .get(queue)
            .map_or(0, |q| q.iter().filter(|m| m.visible_at <= now).count())
    }

    /// All messages in `queue`, leased or not.
    pub fn len(&self, queue: &str) -> usize {
        self.lock().get(queue).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<StoredMessage>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    fn provider(&self) -> &str {
        "memory"
    }

    async fn send_batch(&self, queue: &str, bodies: Vec<String>) -> Result<(), QueueError> {
        let mut queues = self.lock();
        let messages = queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::NotFound(queue.to_string()))?;
        let now = Instant::now();
        for body in bodies {
            let id = format!("msg-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
            messages.push_back(StoredMessage {
                id,
                body,
                sent_at: Utc::now(),
                receive_count: 0,
                visible_at: now,
                receipt_handle: None,
            });
        }
        Ok(())
    }

    async fn poll_batch(
        &self,
        queue: &str,
        max_messages: u32,
        lease: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let mut queues = self.lock();
        let messages = queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::NotFound(queue.to_string()))?;

        let now = Instant::now();
        let mut received = Vec::new();
        for stored in messages.iter_mut() {
            if received.len() >= max_messages as usize {
                break;
            }
            if stored.visible_at > now {
                continue;
            }
            stored.receive_count += 1;
            stored.visible_at = now + lease;
            let receipt_handle = format!("{}-r{}", stored.id, stored.receive_count);
            stored.receipt_handle = Some(receipt_handle.clone());
            received.push(QueueMessage {
                id: stored.id.clone(),
                body: stored.body.clone(),
                receipt_handle,
                timestamp: stored.sent_at,
                attempt_count: stored.receive_count,
            });
        }
        debug!(queue, count = received.len(), "Received memory messages");
        Ok(received)
    }

    async fn ack(&self, queue: &str, receipt_handle: &str) -> Result<(), QueueError> {
        let mut queues = self.lock();
        let messages = queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::NotFound(queue.to_string()))?;
        let position = messages
            .iter()
            .position(|m| m.receipt_handle.as_deref() == Some(receipt_handle))
            .ok_or_else(|| {
                QueueError::Ack(format!("stale or unknown receipt handle {receipt_handle}"))
            })?;
        messages.remove(position);
        Ok(())
    }

    async fn nack(&self, queue: &str, receipt_handle: &str) -> Result<(), QueueError> {
        let mut queues = self.lock();
        let messages = queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::NotFound(queue.to_string()))?;
        let stored = messages
            .iter_mut()
            .find(|m| m.receipt_handle.as_deref() == Some(receipt_handle))
            .ok_or_else(|| {
                QueueError::Provider(format!("stale or unknown receipt handle {receipt_handle}"))
            })?;
        stored.visible_at = Instant::now();
        stored.receipt_handle = None;
        Ok(())
    }

    async fn health_check(&self, queue: &str) -> Result<QueueHealth, QueueError> {
        if !self.lock().contains_key(queue) {
            return Err(QueueError::NotFound(queue.to_string()));
        }
        Ok(QueueHealth {
            connected: true,
            approximate_message_count: Some(self.visible_len(queue) as u64),
            provider: self.provider().to_string(),
        })
    }
}
