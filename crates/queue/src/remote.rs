//! Execution queue backed by a pair of broker queues.
//!
//! The executor side pushes [`TaskSpec`]s to the work queue and drains
//! [`OutcomeRecord`]s from the outcome queue. The worker side leases specs
//! from the work queue and acks them only after their outcome is published.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use mazepa_core::{ExecutionQueue, OperationContext, OutcomeRecord, QueueError, Task, TaskSpec};

use crate::broker::{MessageBroker, QueueMessage};
use crate::config::{outcome_queue_name, work_queue_name, AwsConfig, SqsQueueConfig};
use crate::sqs::SqsBroker;

/// Per-receive cap shared by all brokers.
const RECEIVE_BATCH: u32 = 10;

/// A task spec received from the work queue, hidden from other workers
/// until its lease runs out.
#[derive(Debug, Clone)]
pub struct LeasedTask {
    pub spec: TaskSpec,
    pub message_id: String,
    pub receipt_handle: String,
    /// How many times the broker has delivered this message.
    pub receive_count: u32,
}

pub struct RemoteExecutionQueue<B> {
    name: String,
    broker: Arc<B>,
    work_queue: String,
    outcome_queue: String,
    pull_lease: Duration,
    max_messages_per_pull: u32,
}

pub type SqsExecutionQueue = RemoteExecutionQueue<SqsBroker>;

impl<B: MessageBroker> RemoteExecutionQueue<B> {
    pub fn new(
        broker: Arc<B>,
        work_queue: impl Into<String>,
        outcome_queue: impl Into<String>,
    ) -> Self {
        let work_queue = work_queue.into();
        let outcome_queue = outcome_queue.into();
        Self {
            name: format!("{}:{}", broker.provider(), work_queue),
            broker,
            work_queue,
            outcome_queue,
            pull_lease: Duration::from_secs(600),
            max_messages_per_pull: 500,
        }
    }

    pub fn with_pull_lease(mut self, lease: Duration) -> Self {
        self.pull_lease = lease;
        self
    }

    pub fn with_max_messages_per_pull(mut self, max: u32) -> Self {
        self.max_messages_per_pull = max.max(1);
        self
    }

    pub fn broker(&self) -> &Arc<B> {
        &self.broker
    }

    pub fn work_queue(&self) -> &str {
        &self.work_queue
    }

    pub fn outcome_queue(&self) -> &str {
        &self.outcome_queue
    }

    pub fn pull_lease(&self) -> Duration {
        self.pull_lease
    }

    /// Lease up to `max` task specs from the work queue.
    ///
    /// Malformed messages are acked and dropped so they cannot block the queue.
    pub async fn pull_tasks(
        &self,
        max: u32,
        lease: Duration,
    ) -> Result<Vec<LeasedTask>, QueueError> {
        let messages = self.receive(&self.work_queue, max, lease).await?;
        let mut leased = Vec::with_capacity(messages.len());
        for msg in messages {
            match TaskSpec::from_json(&msg.body) {
                Ok(spec) => leased.push(LeasedTask {
                    spec,
                    message_id: msg.id,
                    receipt_handle: msg.receipt_handle,
                    receive_count: msg.attempt_count,
                }),
                Err(e) => {
                    warn!(message_id = %msg.id, error = %e, "Dropping malformed task message");
                    self.broker.ack(&self.work_queue, &msg.receipt_handle).await?;
                }
            }
        }
        Ok(leased)
    }

    /// Publish the outcome of a leased task, then remove it from the work queue.
    pub async fn publish_outcome(
        &self,
        leased: &LeasedTask,
        record: &OutcomeRecord,
    ) -> Result<(), QueueError> {
        self.broker
            .send_batch(&self.outcome_queue, vec![record.to_json()?])
            .await?;
        self.broker.ack(&self.work_queue, &leased.receipt_handle).await
    }

    /// Give a leased task back to the work queue without an outcome.
    pub async fn release(&self, leased: &LeasedTask) -> Result<(), QueueError> {
        self.broker.nack(&self.work_queue, &leased.receipt_handle).await
    }

    /// Receive up to `max` messages from `queue` in broker-sized chunks.
    async fn receive(
        &self,
        queue: &str,
        max: u32,
        lease: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let mut messages = Vec::new();
        while (messages.len() as u32) < max {
            let want = (max - messages.len() as u32).min(RECEIVE_BATCH);
            let batch = self.broker.poll_batch(queue, want, lease).await?;
            let received = batch.len() as u32;
            messages.extend(batch);
            if received < want {
                break;
            }
        }
        Ok(messages)
    }
}

impl SqsExecutionQueue {
    /// Connect to existing work and outcome queues.
    pub fn from_config(aws: &AwsConfig, config: &SqsQueueConfig) -> Result<Self, QueueError> {
        let broker = SqsBroker::new(aws, config.receive_wait_sec)?;
        Ok(Self::new(
            Arc::new(broker),
            config.work_queue_url.clone(),
            config.outcome_queue_url.clone(),
        )
        .with_pull_lease(config.pull_lease())
        .with_max_messages_per_pull(config.max_messages_per_pull))
    }

    /// Create the `zzz-<execution_id>-work` / `-outcome` queue pair.
    pub async fn for_execution(
        aws: &AwsConfig,
        execution_id: &str,
        receive_wait_sec: u32,
    ) -> Result<Self, QueueError> {
        let broker = SqsBroker::new(aws, receive_wait_sec)?;
        let work = broker.create_queue(&work_queue_name(execution_id)).await?;
        let outcome = broker.create_queue(&outcome_queue_name(execution_id)).await?;
        info!(
            execution_id,
            work_queue = %work,
            outcome_queue = %outcome,
            "Created execution queues"
        );
        Ok(Self::new(Arc::new(broker), work, outcome))
    }

    /// Delete both queues of this execution.
    pub async fn delete_queues(&self) -> Result<(), QueueError> {
        self.broker.delete_queue(&self.work_queue).await?;
        self.broker.delete_queue(&self.outcome_queue).await
    }
}

#[async_trait]
impl<B: MessageBroker + 'static> ExecutionQueue for RemoteExecutionQueue<B> {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_local(&self) -> bool {
        false
    }

    async fn push_tasks(
        &self,
        tasks: Vec<Task>,
        _ctx: &OperationContext,
    ) -> Result<(), QueueError> {
        if tasks.is_empty() {
            return Ok(());
        }
        let bodies = tasks
            .iter()
            .map(|t| TaskSpec::from_task(t).to_json())
            .collect::<Result<Vec<_>, _>>()?;
        let count = bodies.len();
        self.broker.send_batch(&self.work_queue, bodies).await?;
        debug!(queue = %self.work_queue, count, "Pushed task specs");
        Ok(())
    }

    /// Outcomes are parsed before any message is acked. A failed ack is only
    /// logged: the message comes back after its lease and the execution state
    /// ignores the duplicate.
    async fn pull_task_outcomes(&self, max_num: usize) -> Result<Vec<OutcomeRecord>, QueueError> {
        let max = (max_num.min(u32::MAX as usize) as u32).clamp(1, self.max_messages_per_pull);
        let messages = self.receive(&self.outcome_queue, max, self.pull_lease).await?;

        let mut records = Vec::with_capacity(messages.len());
        for msg in &messages {
            match OutcomeRecord::from_json(&msg.body) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(message_id = %msg.id, error = %e, "Dropping malformed outcome message")
                }
            }
        }
        for msg in &messages {
            if let Err(e) = self.broker.ack(&self.outcome_queue, &msg.receipt_handle).await {
                warn!(message_id = %msg.id, error = %e, "Failed to ack outcome message");
            }
        }
        if !records.is_empty() {
            debug!(queue = %self.outcome_queue, count = records.len(), "Pulled task outcomes");
        }
        Ok(records)
    }
}
