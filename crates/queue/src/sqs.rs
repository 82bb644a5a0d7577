//! AWS SQS broker implementation.

use std::time::Duration;

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_sqs::config::BehaviorVersion;
use aws_sdk_sqs::types::{
    MessageSystemAttributeName, QueueAttributeName, SendMessageBatchRequestEntry,
};
use aws_sdk_sqs::Client;
use chrono::{TimeZone, Utc};
use tracing::{debug, info};

use mazepa_core::QueueError;

use crate::broker::{MessageBroker, QueueHealth, QueueMessage};
use crate::config::AwsConfig;

/// SQS caps batch sends and receives at 10 messages per request.
const SQS_BATCH_LIMIT: usize = 10;

/// SQS-backed message broker. Queues are addressed by URL.
pub struct SqsBroker {
    client: Client,
    receive_wait_secs: i32,
}

impl SqsBroker {
    /// Create a new SQS broker from project config.
    pub fn new(aws: &AwsConfig, receive_wait_secs: u32) -> Result<Self, QueueError> {
        let region = aws_sdk_sqs::config::Region::new(aws.region.clone());

        // Built directly: aws_config::defaults() reads AWS_ENDPOINT_URL, which may
        // point at another service and would route all SQS requests there.
        let mut sqs_config = aws_sdk_sqs::Config::builder()
            .region(region)
            .behavior_version(BehaviorVersion::latest());

        if let (Some(key_id), Some(secret)) = (&aws.access_key_id, &aws.secret_access_key) {
            let creds = Credentials::new(
                key_id,
                secret,
                aws.session_token.clone(),
                None,
                "mazepa-queue-static",
            );
            sqs_config = sqs_config.credentials_provider(creds);
        }

        // Only apply endpoint override if QUEUE_AWS_ENDPOINT_URL is explicitly set.
        if let Some(ref endpoint) = aws.endpoint_url {
            if !endpoint.is_empty() {
                let url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
                    endpoint.clone()
                } else {
                    format!("https://{endpoint}")
                };
                sqs_config = sqs_config.endpoint_url(&url);
            }
        }

        let client = Client::from_conf(sqs_config.build());
        info!(region = %aws.region, "SQS broker initialized");

        Ok(Self {
            client,
            receive_wait_secs: receive_wait_secs.min(20) as i32,
        })
    }

    /// Create (or look up) a queue by name and return its URL.
    pub async fn create_queue(&self, name: &str) -> Result<String, QueueError> {
        let resp = self
            .client
            .create_queue()
            .queue_name(name)
            .send()
            .await
            .map_err(|e| QueueError::Provider(format!("SQS create queue failed: {e:?}")))?;
        let url = resp
            .queue_url()
            .ok_or_else(|| QueueError::NotFound(format!("no url returned for queue {name}")))?
            .to_string();
        info!(queue = name, queue_url = %url, "SQS queue ready");
        Ok(url)
    }

    pub async fn delete_queue(&self, queue_url: &str) -> Result<(), QueueError> {
        self.client
            .delete_queue()
            .queue_url(queue_url)
            .send()
            .await
            .map_err(|e| QueueError::Provider(format!("SQS delete queue failed: {e:?}")))?;
        info!(queue_url, "SQS queue deleted");
        Ok(())
    }
}

#[async_trait]
impl MessageBroker for SqsBroker {
    fn provider(&self) -> &str {
        "sqs"
    }

    async fn send_batch(&self, queue: &str, bodies: Vec<String>) -> Result<(), QueueError> {
        for chunk in bodies.chunks(SQS_BATCH_LIMIT) {
            let entries = chunk
                .iter()
                .enumerate()
                .map(|(i, body)| {
                    SendMessageBatchRequestEntry::builder()
                        .id(i.to_string())
                        .message_body(body)
                        .build()
                        .map_err(|e| QueueError::Encode(format!("SQS batch entry: {e}")))
                })
                .collect::<Result<Vec<_>, _>>()?;

            let resp = self
                .client
                .send_message_batch()
                .queue_url(queue)
                .set_entries(Some(entries))
                .send()
                .await
                .map_err(|e| QueueError::Connection(format!("SQS send failed: {e:?}")))?;

            if let Some(failed) = resp.failed().first() {
                return Err(QueueError::Provider(format!(
                    "SQS rejected {} of {} messages (first: {} {})",
                    resp.failed().len(),
                    chunk.len(),
                    failed.code(),
                    failed.message().unwrap_or("")
                )));
            }
            debug!(queue, count = chunk.len(), "Sent SQS messages");
        }
        Ok(())
    }

    async fn poll_batch(
        &self,
        queue: &str,
        max_messages: u32,
        lease: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let capped = max_messages.clamp(1, SQS_BATCH_LIMIT as u32) as i32;

        debug!(queue, max_messages = capped, "Polling SQS");

        let resp = self
            .client
            .receive_message()
            .queue_url(queue)
            .max_number_of_messages(capped)
            .wait_time_seconds(self.receive_wait_secs)
            .visibility_timeout(lease.as_secs().min(i32::MAX as u64) as i32)
            .message_system_attribute_names(MessageSystemAttributeName::All)
            .send()
            .await
            .map_err(|e| QueueError::Connection(format!("SQS receive failed: {e:?}")))?;

        let sqs_messages = resp.messages.unwrap_or_default();
        debug!(count = sqs_messages.len(), "Received SQS messages");

        let mut messages = Vec::with_capacity(sqs_messages.len());
        for msg in sqs_messages {
            let id = msg.message_id().unwrap_or("unknown").to_string();
            let body = msg.body().unwrap_or("").to_string();
            let receipt_handle = msg
                .receipt_handle()
                .ok_or_else(|| QueueError::Parse("missing receipt handle".into()))?
                .to_string();

            // SentTimestamp is epoch millis.
            let timestamp = msg
                .attributes()
                .and_then(|attrs| attrs.get(&MessageSystemAttributeName::SentTimestamp))
                .and_then(|ts| ts.parse::<i64>().ok())
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .unwrap_or_else(Utc::now);

            let attempt_count = msg
                .attributes()
                .and_then(|attrs| attrs.get(&MessageSystemAttributeName::ApproximateReceiveCount))
                .and_then(|c| c.parse::<u32>().ok())
                .unwrap_or(1);

            messages.push(QueueMessage {
                id,
                body,
                receipt_handle,
                timestamp,
                attempt_count,
            });
        }

        Ok(messages)
    }

    async fn ack(&self, queue: &str, receipt_handle: &str) -> Result<(), QueueError> {
        debug!(receipt_handle, "Acking SQS message");

        self.client
            .delete_message()
            .queue_url(queue)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| QueueError::Ack(format!("SQS delete failed: {e:?}")))?;

        Ok(())
    }

    async fn nack(&self, queue: &str, receipt_handle: &str) -> Result<(), QueueError> {
        debug!(receipt_handle, "Nacking SQS message (visibility=0)");

        self.client
            .change_message_visibility()
            .queue_url(queue)
            .receipt_handle(receipt_handle)
            .visibility_timeout(0)
            .send()
            .await
            .map_err(|e| QueueError::Provider(format!("SQS visibility change failed: {e:?}")))?;

        Ok(())
    }

    async fn health_check(&self, queue: &str) -> Result<QueueHealth, QueueError> {
        let resp = self
            .client
            .get_queue_attributes()
            .queue_url(queue)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .send()
            .await
            .map_err(|e| QueueError::Connection(format!("SQS health check failed: {e:?}")))?;

        let count = resp
            .attributes()
            .and_then(|attrs| attrs.get(&QueueAttributeName::ApproximateNumberOfMessages))
            .and_then(|v| v.parse::<u64>().ok());

        Ok(QueueHealth {
            connected: true,
            approximate_message_count: count,
            provider: self.provider().to_string(),
        })
    }
}
