use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use mazepa_core::{
    execute, Dependency, ErrorKind, ExecutionQueue, ExecutorConfig, FlowError, FlowSchema,
    OperationContext, OperationRegistry, OutcomeRecord, QueueError, TaskError, TaskStatus,
    TaskableOperation,
};
use mazepa_queue::{
    generated_worker_name, MemoryBroker, MessageBroker, QueueHealth, QueueMessage,
    RemoteExecutionQueue, Worker,
};

const WORK: &str = "zzz-test-work";
const OUTCOME: &str = "zzz-test-outcome";

fn memory_queue() -> Arc<RemoteExecutionQueue<MemoryBroker>> {
    let broker = Arc::new(MemoryBroker::with_queues([WORK, OUTCOME]));
    Arc::new(
        RemoteExecutionQueue::new(broker, WORK, OUTCOME).with_pull_lease(Duration::from_secs(30)),
    )
}

fn add_one(calls: &Arc<AtomicUsize>) -> TaskableOperation {
    let calls = Arc::clone(calls);
    TaskableOperation::from_fn("add_one", move |x: i64| {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok::<_, TaskError>(x + 1)
    })
}

/// Chain of `depth` tasks, each fed the previous return value.
fn chain(op: &TaskableOperation) -> FlowSchema<i64> {
    let op = op.clone();
    FlowSchema::new("chain", move |cx, depth: i64| {
        let op = op.clone();
        async move {
            let mut value = 0;
            for _ in 0..depth {
                let task = cx.submit(op.make_task(value)?);
                cx.wait(Dependency::on(&task)).await?;
                value = cx
                    .return_value(&task)
                    .and_then(|v| v.as_i64())
                    .ok_or_else(|| FlowError::failed("missing return value"))?;
            }
            Ok(())
        }
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn executor_and_worker_share_memory_queues() {
    let calls = Arc::new(AtomicUsize::new(0));
    let op = add_one(&calls);
    let queue = memory_queue();

    let mut worker = Worker::new(
        generated_worker_name(),
        Arc::clone(&queue),
        OperationRegistry::new().with(op.clone()),
    )
    .idle_sleep(Duration::from_millis(5));
    let shutdown = worker.shutdown_handle();
    let handle = tokio::spawn(async move { worker.run().await });

    let config = ExecutorConfig {
        batch_gap_sleep_sec: 0.01,
        do_dryrun_estimation: false,
        show_progress: false,
        ..ExecutorConfig::default()
    };
    let summary = execute(chain(&op).call(3), &config, &*queue).await.unwrap();

    shutdown.notify_one();
    let stats = handle.await.unwrap().unwrap();

    assert_eq!(summary.tasks_executed, 3);
    assert!(summary.gap_sleeps >= 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(stats.tasks_processed, 3);
    assert_eq!(stats.tasks_succeeded, 3);
    assert!(queue.broker().is_empty(WORK));
    assert!(queue.broker().is_empty(OUTCOME));
}

#[tokio::test(start_paused = true)]
async fn unacked_tasks_are_redelivered_after_lease() {
    let calls = Arc::new(AtomicUsize::new(0));
    let op = add_one(&calls);
    let queue = memory_queue();
    let ctx = OperationContext::new("exec-redeliver");

    queue
        .push_tasks(vec![op.make_task(1).unwrap(), op.make_task(2).unwrap()], &ctx)
        .await
        .unwrap();

    let first = queue.pull_tasks(10, Duration::from_secs(30)).await.unwrap();
    assert_eq!(first.len(), 2);
    assert!(queue.pull_tasks(10, Duration::from_secs(30)).await.unwrap().is_empty());

    tokio::time::advance(Duration::from_secs(31)).await;
    let again = queue.pull_tasks(10, Duration::from_secs(30)).await.unwrap();
    assert_eq!(again.len(), 2);
    assert!(again.iter().all(|t| t.receive_count == 2));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn released_task_is_visible_again() {
    let calls = Arc::new(AtomicUsize::new(0));
    let op = add_one(&calls);
    let queue = memory_queue();
    let ctx = OperationContext::new("exec-release");

    queue.push_tasks(vec![op.make_task(5).unwrap()], &ctx).await.unwrap();
    let leased = queue.pull_tasks(1, Duration::from_secs(30)).await.unwrap().remove(0);
    assert_eq!(queue.broker().visible_len(WORK), 0);

    queue.release(&leased).await.unwrap();
    assert_eq!(queue.broker().visible_len(WORK), 1);
}

#[tokio::test]
async fn worker_publishes_outcomes_and_acks_work() {
    let calls = Arc::new(AtomicUsize::new(0));
    let op = add_one(&calls);
    let queue = memory_queue();
    let ctx = OperationContext::new("exec-worker");

    let tasks = vec![op.make_task(1).unwrap(), op.make_task(2).unwrap(), op.make_task(3).unwrap()];
    queue.push_tasks(tasks, &ctx).await.unwrap();

    let registry = OperationRegistry::new().with(op);
    let mut worker = Worker::new("w1", Arc::clone(&queue), registry).batch_size(2);
    assert_eq!(worker.run_until_idle().await.unwrap(), 3);
    assert!(queue.broker().is_empty(WORK));

    let mut outcomes = queue.pull_task_outcomes(100).await.unwrap();
    outcomes.sort_by_key(|r| r.outcome.return_value().and_then(Value::as_i64));
    let values: Vec<_> = outcomes
        .iter()
        .map(|r| r.outcome.return_value().cloned())
        .collect();
    assert_eq!(values, vec![Some(json!(2)), Some(json!(3)), Some(json!(4))]);
    assert!(outcomes.iter().all(|r| r.status == TaskStatus::Succeeded));
    assert!(queue.broker().is_empty(OUTCOME));
}

#[tokio::test]
async fn unknown_operation_is_reported_as_failure() {
    let calls = Arc::new(AtomicUsize::new(0));
    let op = add_one(&calls);
    let queue = memory_queue();
    let ctx = OperationContext::new("exec-unknown");
    let task = op.make_task(1).unwrap();
    let task_id = task.id().clone();
    queue.push_tasks(vec![task], &ctx).await.unwrap();

    let mut worker = Worker::new("w-empty", Arc::clone(&queue), OperationRegistry::new());
    assert_eq!(worker.run_until_idle().await.unwrap(), 1);
    assert_eq!(worker.stats().unknown_operations, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let outcomes = queue.pull_task_outcomes(10).await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].task_id, task_id);
    assert_eq!(outcomes[0].status, TaskStatus::Failed);
    let error = outcomes[0].outcome.error().unwrap();
    assert_eq!(error.kind, ErrorKind::UnknownOperation);
}

#[tokio::test]
async fn malformed_messages_are_dropped() {
    let queue = memory_queue();
    queue
        .broker()
        .send_batch(WORK, vec!["not json".into()])
        .await
        .unwrap();
    queue
        .broker()
        .send_batch(OUTCOME, vec!["{\"task_id\": 3}".into()])
        .await
        .unwrap();

    assert!(queue.pull_tasks(10, Duration::from_secs(30)).await.unwrap().is_empty());
    assert!(queue.pull_task_outcomes(10).await.unwrap().is_empty());
    assert!(queue.broker().is_empty(WORK));
    assert!(queue.broker().is_empty(OUTCOME));
}

#[tokio::test]
async fn outcome_pull_respects_cap() {
    let queue = Arc::new(
        RemoteExecutionQueue::new(
            Arc::new(MemoryBroker::with_queues([WORK, OUTCOME])),
            WORK,
            OUTCOME,
        )
        .with_max_messages_per_pull(12),
    );
    let calls = Arc::new(AtomicUsize::new(0));
    let op = add_one(&calls);
    let ctx = OperationContext::new("exec-cap");
    let tasks = (0..25).map(|i| op.make_task(i).unwrap()).collect();
    queue.push_tasks(tasks, &ctx).await.unwrap();

    let registry = OperationRegistry::new().with(op);
    let mut worker = Worker::new("w-cap", Arc::clone(&queue), registry).batch_size(25);
    assert_eq!(worker.run_until_idle().await.unwrap(), 25);

    assert_eq!(queue.pull_task_outcomes(100).await.unwrap().len(), 12);
    assert_eq!(queue.pull_task_outcomes(5).await.unwrap().len(), 5);
    assert_eq!(queue.pull_task_outcomes(100).await.unwrap().len(), 8);
    assert!(!queue.is_local());
    assert_eq!(queue.name(), "memory:zzz-test-work");
}

/// Memory broker whose next ack fails once.
struct AckFailsOnce {
    inner: MemoryBroker,
    fail_next_ack: AtomicBool,
}

#[async_trait]
impl MessageBroker for AckFailsOnce {
    fn provider(&self) -> &str {
        "ack-fails-once"
    }

    async fn send_batch(&self, queue: &str, bodies: Vec<String>) -> Result<(), QueueError> {
        self.inner.send_batch(queue, bodies).await
    }

    async fn poll_batch(
        &self,
        queue: &str,
        max_messages: u32,
        lease: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        self.inner.poll_batch(queue, max_messages, lease).await
    }

    async fn ack(&self, queue: &str, receipt_handle: &str) -> Result<(), QueueError> {
        if self.fail_next_ack.swap(false, Ordering::SeqCst) {
            return Err(QueueError::Ack("connection dropped".into()));
        }
        self.inner.ack(queue, receipt_handle).await
    }

    async fn nack(&self, queue: &str, receipt_handle: &str) -> Result<(), QueueError> {
        self.inner.nack(queue, receipt_handle).await
    }

    async fn health_check(&self, queue: &str) -> Result<QueueHealth, QueueError> {
        self.inner.health_check(queue).await
    }
}

#[tokio::test(start_paused = true)]
async fn failed_outcome_ack_keeps_pulled_records() {
    let broker = Arc::new(AckFailsOnce {
        inner: MemoryBroker::with_queues([WORK, OUTCOME]),
        fail_next_ack: AtomicBool::new(true),
    });
    let queue = RemoteExecutionQueue::new(Arc::clone(&broker), WORK, OUTCOME)
        .with_pull_lease(Duration::from_secs(30));

    let calls = Arc::new(AtomicUsize::new(0));
    let op = add_one(&calls);
    let bodies = (0..3)
        .map(|i| OutcomeRecord::dry_run(&op.make_task(i).unwrap()).to_json().unwrap())
        .collect();
    broker.send_batch(OUTCOME, bodies).await.unwrap();

    let records = queue.pull_task_outcomes(10).await.unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(broker.inner.len(OUTCOME), 1);

    tokio::time::advance(Duration::from_secs(31)).await;
    let redelivered = queue.pull_task_outcomes(10).await.unwrap();
    assert_eq!(redelivered.len(), 1);
    assert!(records.contains(&redelivered[0]));
    assert!(broker.inner.is_empty(OUTCOME));
}
