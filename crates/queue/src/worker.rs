//! Remote worker: leases task specs, runs them through the operation
//! registry and publishes their outcomes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use mazepa_core::{
    ErrorKind, OperationContext, OperationRegistry, OutcomeRecord, QueueError, TaskError,
    TaskOutcome, TaskStatus,
};

use crate::broker::MessageBroker;
use crate::remote::{LeasedTask, RemoteExecutionQueue};

/// `worker-<8 hex>`, unique per call.
pub fn generated_worker_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("worker-{}", &id[..8])
}

/// Counts kept by a [`Worker`] across its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub tasks_processed: usize,
    pub tasks_succeeded: usize,
    pub tasks_failed: usize,
    pub unknown_operations: usize,
}

pub struct Worker<B> {
    name: String,
    queue: Arc<RemoteExecutionQueue<B>>,
    registry: OperationRegistry,
    ctx: OperationContext,
    batch_size: u32,
    idle_sleep: Duration,
    debug: bool,
    shutdown: Arc<Notify>,
    stats: WorkerStats,
}

impl<B: MessageBroker + 'static> Worker<B> {
    pub fn new(
        name: impl Into<String>,
        queue: Arc<RemoteExecutionQueue<B>>,
        registry: OperationRegistry,
    ) -> Self {
        let name = name.into();
        Self {
            ctx: OperationContext::new(name.clone()),
            name,
            queue,
            registry,
            batch_size: 1,
            idle_sleep: Duration::from_secs(1),
            debug: false,
            shutdown: Arc::new(Notify::new()),
            stats: WorkerStats::default(),
        }
    }

    /// Tasks leased per pull (default: 1).
    pub fn batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Pause after an empty pull in [`Worker::run`] (default: 1s).
    pub fn idle_sleep(mut self, idle_sleep: Duration) -> Self {
        self.idle_sleep = idle_sleep;
        self
    }

    /// Skip runtime limits, as the local debug queue does.
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    /// Handle for stopping [`Worker::run`] from elsewhere.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    /// Process tasks until a pull comes back empty. Returns how many ran.
    pub async fn run_until_idle(&mut self) -> Result<usize, QueueError> {
        let mut processed = 0;
        loop {
            let n = self.process_batch().await?;
            if n == 0 {
                return Ok(processed);
            }
            processed += n;
        }
    }

    /// Process tasks until the shutdown handle is notified.
    ///
    /// Tasks leased by an interrupted batch are redelivered once their
    /// lease expires.
    pub async fn run(&mut self) -> Result<WorkerStats, QueueError> {
        info!(worker = %self.name, queue = %self.queue.work_queue(), "Worker started");
        let shutdown = Arc::clone(&self.shutdown);
        loop {
            let n = tokio::select! {
                _ = shutdown.notified() => break,
                n = self.process_batch() => n?,
            };
            if n == 0 {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    _ = tokio::time::sleep(self.idle_sleep) => {}
                }
            }
        }
        self.ctx.clear();
        info!(worker = %self.name, processed = self.stats.tasks_processed, "Worker stopped");
        Ok(self.stats)
    }

    async fn process_batch(&mut self) -> Result<usize, QueueError> {
        let leased = self.queue.pull_tasks(self.batch_size, self.queue.pull_lease()).await?;
        let n = leased.len();
        for task in leased {
            self.process(task).await?;
        }
        Ok(n)
    }

    async fn process(&mut self, leased: LeasedTask) -> Result<(), QueueError> {
        let record = match self.registry.task_from_spec(&leased.spec) {
            Some(mut task) => {
                debug!(
                    worker = %self.name,
                    task_id = %leased.spec.task_id,
                    receive_count = leased.receive_count,
                    "Executing leased task"
                );
                task.execute(&self.ctx, self.debug).await;
                OutcomeRecord::from_task(&task)
            }
            None => {
                warn!(
                    worker = %self.name,
                    operation = %leased.spec.operation_name,
                    "Unknown operation, publishing failure"
                );
                self.stats.unknown_operations += 1;
                OutcomeRecord {
                    task_id: leased.spec.task_id.clone(),
                    attempt: leased.spec.attempt,
                    status: TaskStatus::Failed,
                    outcome: TaskOutcome::failure(
                        TaskError::new(
                            ErrorKind::UnknownOperation,
                            format!("operation {} is not registered", leased.spec.operation_name),
                        ),
                        0.0,
                    ),
                }
            }
        };

        self.stats.tasks_processed += 1;
        if record.status == TaskStatus::Succeeded {
            self.stats.tasks_succeeded += 1;
        } else {
            self.stats.tasks_failed += 1;
        }
        self.queue.publish_outcome(&leased, &record).await
    }
}
