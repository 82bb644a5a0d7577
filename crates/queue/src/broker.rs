//! Message broker trait and types.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mazepa_core::QueueError;

/// A raw message received from a broker queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Unique message identifier from the broker.
    pub id: String,
    /// Raw message body (JSON string).
    pub body: String,
    /// Handle for ack/nack, valid for the current lease only.
    pub receipt_handle: String,
    /// When the message was sent to the queue.
    pub timestamp: DateTime<Utc>,
    /// Number of times this message has been received.
    pub attempt_count: u32,
}

/// Health status of a broker queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueHealth {
    pub connected: bool,
    /// Approximate number of visible messages.
    pub approximate_message_count: Option<u64>,
    /// Broker provider name (e.g., "sqs", "memory").
    pub provider: String,
}

impl fmt::Display for QueueHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QueueHealth {{ connected: {}, messages: {:?}, provider: {} }}",
            self.connected, self.approximate_message_count, self.provider
        )
    }
}

/// Trait for message broker backends.
///
/// Queues are addressed by the broker's own identifier (a queue URL for SQS,
/// a name for the in-memory broker). Received messages stay invisible to
/// other receivers for the lease duration; if they are not acked before it
/// expires they are delivered again.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Provider name used in logs and health reports.
    fn provider(&self) -> &str;

    /// Send message bodies to `queue`.
    async fn send_batch(&self, queue: &str, bodies: Vec<String>) -> Result<(), QueueError>;

    /// Receive up to `max_messages`, hiding them for `lease`.
    ///
    /// Returns an empty vec if no messages are available.
    async fn poll_batch(
        &self,
        queue: &str,
        max_messages: u32,
        lease: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError>;

    /// Acknowledge successful processing. Removes the message.
    async fn ack(&self, queue: &str, receipt_handle: &str) -> Result<(), QueueError>;

    /// Return the message to the queue immediately.
    async fn nack(&self, queue: &str, receipt_handle: &str) -> Result<(), QueueError>;

    /// Check connectivity and return health status.
    async fn health_check(&self, queue: &str) -> Result<QueueHealth, QueueError>;
}
