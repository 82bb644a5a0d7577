//! Taskable operations: callables that can be turned into [`Task`]s.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::context::OperationContext;
use crate::error::MazepaError;
use crate::task::{ErrorKind, Task, TaskError, TaskStatus};

/// An asynchronous unit of work that can run inside a task.
///
/// Implement this directly when the operation needs the per-run
/// [`OperationContext`]; plain closures go through
/// [`TaskableOperation::from_fn`].
#[async_trait]
pub trait Operation: Send + Sync {
    async fn call(&self, args: Value, ctx: &OperationContext) -> Result<Value, TaskError>;
}

type BlockingFn = dyn Fn(Value) -> Result<Value, TaskError> + Send + Sync;

/// Synchronous closure run on the blocking pool so the runtime limit can
/// fire even while it is busy.
struct FnOperation {
    f: Arc<BlockingFn>,
}

#[async_trait]
impl Operation for FnOperation {
    async fn call(&self, args: Value, _ctx: &OperationContext) -> Result<Value, TaskError> {
        let f = Arc::clone(&self.f);
        match tokio::task::spawn_blocking(move || f(args)).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                Err(TaskError::new(ErrorKind::Panic, panic_message(e.into_panic())))
            }
            Err(e) => Err(TaskError::runtime(format!("blocking task cancelled: {e}"))),
        }
    }
}

/// A declared retryable failure: errors of `kind` whose message contains
/// `message_contains` are classified as transient.
#[derive(Debug, Clone, PartialEq)]
pub struct TransientErrorCondition {
    pub kind: ErrorKind,
    pub message_contains: String,
}

impl TransientErrorCondition {
    pub fn new(kind: ErrorKind, message_contains: impl Into<String>) -> Self {
        Self {
            kind,
            message_contains: message_contains.into(),
        }
    }

    pub fn matches(&self, error: &TaskError) -> bool {
        error.kind == self.kind && error.message.contains(&self.message_contains)
    }
}

/// A named operation with a runtime limit and transient error table.
///
/// Cheap to clone; every task made from it shares the same callable.
#[derive(Clone)]
pub struct TaskableOperation {
    name: Arc<str>,
    op: Arc<dyn Operation>,
    runtime_limit: Option<Duration>,
    transient_error_conditions: Arc<[TransientErrorCondition]>,
}

impl fmt::Debug for TaskableOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskableOperation")
            .field("name", &self.name)
            .field("runtime_limit", &self.runtime_limit)
            .field("transient_error_conditions", &self.transient_error_conditions)
            .finish()
    }
}

impl TaskableOperation {
    pub fn new(name: impl Into<String>, op: impl Operation + 'static) -> Self {
        Self {
            name: Arc::from(name.into()),
            op: Arc::new(op),
            runtime_limit: None,
            transient_error_conditions: Arc::from(Vec::new()),
        }
    }

    /// Wrap a synchronous closure taking typed arguments.
    pub fn from_fn<A, R, F>(name: impl Into<String>, f: F) -> Self
    where
        A: DeserializeOwned + 'static,
        R: Serialize + 'static,
        F: Fn(A) -> Result<R, TaskError> + Send + Sync + 'static,
    {
        let name = name.into();
        let op_name = name.clone();
        let erased = move |args: Value| -> Result<Value, TaskError> {
            let args: A = serde_json::from_value(args)
                .map_err(|e| TaskError::value(format!("invalid arguments for {op_name}: {e}")))?;
            let ret = f(args)?;
            serde_json::to_value(ret)
                .map_err(|e| {
                    TaskError::value(format!("unserializable return value from {op_name}: {e}"))
                })
        };
        Self::new(name, FnOperation { f: Arc::new(erased) })
    }

    pub fn with_runtime_limit(mut self, limit: Duration) -> Self {
        self.runtime_limit = Some(limit);
        self
    }

    pub fn with_transient_error_condition(mut self, condition: TransientErrorCondition) -> Self {
        let mut conditions = self.transient_error_conditions.to_vec();
        conditions.push(condition);
        self.transient_error_conditions = Arc::from(conditions);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn runtime_limit(&self) -> Option<Duration> {
        self.runtime_limit
    }

    pub fn transient_error_conditions(&self) -> &[TransientErrorCondition] {
        &self.transient_error_conditions
    }

    /// Bind arguments into a new `Pending` task.
    pub fn make_task(&self, args: impl Serialize) -> Result<Task, MazepaError> {
        let args = serde_json::to_value(args)?;
        Ok(Task::new(self.clone(), args))
    }

    /// Invoke the operation directly, outside of any task bookkeeping.
    pub async fn call(
        &self,
        args: impl Serialize,
        ctx: &OperationContext,
    ) -> Result<Value, TaskError> {
        let args = serde_json::to_value(args).map_err(|e| TaskError::value(e.to_string()))?;
        self.invoke(args, ctx, false).await
    }

    pub(crate) async fn invoke(
        &self,
        args: Value,
        ctx: &OperationContext,
        debug: bool,
    ) -> Result<Value, TaskError> {
        let fut = AssertUnwindSafe(self.op.call(args, ctx)).catch_unwind();
        let caught = match self.runtime_limit {
            Some(limit) if !debug => match tokio::time::timeout(limit, fut).await {
                Ok(caught) => caught,
                Err(_) => {
                    return Err(TaskError::timeout(format!(
                        "{} exceeded runtime limit of {:.3}s",
                        self.name,
                        limit.as_secs_f64()
                    )))
                }
            },
            _ => fut.await,
        };
        caught.unwrap_or_else(|panic| Err(TaskError::new(ErrorKind::Panic, panic_message(panic))))
    }

    /// Map a captured error to the terminal status it earns.
    pub fn classify(&self, error: &TaskError) -> TaskStatus {
        if error.is_timeout() {
            return TaskStatus::Failed;
        }
        if self.transient_error_conditions.iter().any(|c| c.matches(error)) {
            TaskStatus::TransientError
        } else {
            TaskStatus::Failed
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "operation panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    struct Doubler;

    #[async_trait]
    impl Operation for Doubler {
        async fn call(&self, args: Value, _ctx: &OperationContext) -> Result<Value, TaskError> {
            let n = args.as_i64().ok_or_else(|| TaskError::value("expected integer"))?;
            Ok(json!(n * 2))
        }
    }

    #[tokio::test]
    async fn make_task_binds_operation_name() {
        let op = TaskableOperation::from_fn("OpDummy", |_: ()| Ok::<_, TaskError>("result"));
        let task = op.make_task(()).unwrap();
        assert_eq!(task.operation_name(), "OpDummy");
        assert_eq!(task.status(), TaskStatus::Pending);

        let ctx = OperationContext::new("test");
        assert_eq!(op.call((), &ctx).await.unwrap(), json!("result"));
    }

    #[tokio::test]
    async fn trait_operation_runs_as_task() {
        let op = TaskableOperation::new("double", Doubler);
        let ctx = OperationContext::new("test");
        let mut task = op.make_task(21).unwrap();
        let outcome = task.execute(&ctx, false).await;
        assert_eq!(outcome.return_value(), Some(&json!(42)));
        assert_eq!(task.status(), TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn runtime_limit_produces_timeout() {
        let op = TaskableOperation::from_fn("sleepy", |_: ()| {
            std::thread::sleep(Duration::from_millis(300));
            Err::<(), _>(TaskError::value("should not surface"))
        })
        .with_runtime_limit(Duration::from_millis(100));

        let ctx = OperationContext::new("test");
        let mut task = op.make_task(()).unwrap();
        let outcome = task.execute(&ctx, false).await;
        let error = outcome.error().expect("expected a failure");
        assert_eq!(error.kind, ErrorKind::Timeout);
        assert_eq!(task.status(), TaskStatus::Failed);
    }

    #[tokio::test]
    async fn debug_mode_skips_runtime_limit() {
        let op = TaskableOperation::from_fn("sleepy", |_: ()| {
            std::thread::sleep(Duration::from_millis(50));
            Ok::<_, TaskError>(1)
        })
        .with_runtime_limit(Duration::from_millis(1));

        let ctx = OperationContext::new("test");
        let mut task = op.make_task(()).unwrap();
        task.execute(&ctx, true).await;
        assert_eq!(task.status(), TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn transient_error_condition_matches_kind_and_message() {
        let op = TaskableOperation::from_fn("flaky", |transient: bool| {
            if transient {
                Err::<(), _>(TaskError::value("No More"))
            } else {
                Err(TaskError::value("Yes More"))
            }
        })
        .with_transient_error_condition(TransientErrorCondition::new(ErrorKind::Value, "No More"));

        let ctx = OperationContext::new("test");

        let mut transient = op.make_task(true).unwrap();
        transient.execute(&ctx, false).await;
        assert_eq!(transient.status(), TaskStatus::TransientError);

        let mut fatal = op.make_task(false).unwrap();
        fatal.execute(&ctx, false).await;
        assert_eq!(fatal.status(), TaskStatus::Failed);
    }

    #[tokio::test]
    async fn transient_condition_requires_matching_kind() {
        let op = TaskableOperation::from_fn("io", |_: ()| Err::<(), _>(TaskError::io("No More")))
            .with_transient_error_condition(TransientErrorCondition::new(
                ErrorKind::Value,
                "No More",
            ));
        let ctx = OperationContext::new("test");
        let mut task = op.make_task(()).unwrap();
        task.execute(&ctx, false).await;
        assert_eq!(task.status(), TaskStatus::Failed);
    }

    #[tokio::test]
    async fn panics_are_captured() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let op = TaskableOperation::from_fn("boom", move |_: ()| -> Result<(), TaskError> {
            counter.fetch_add(1, Ordering::SeqCst);
            panic!("kaboom")
        });
        let ctx = OperationContext::new("test");
        let mut task = op.make_task(()).unwrap();
        let outcome = task.execute(&ctx, false).await;
        let error = outcome.error().unwrap();
        assert_eq!(error.kind, ErrorKind::Panic);
        assert!(error.message.contains("kaboom"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_arguments_fail_with_value_error() {
        let op = TaskableOperation::from_fn("typed", |n: u32| Ok::<_, TaskError>(n + 1));
        let ctx = OperationContext::new("test");
        let mut task = op.make_task("not a number").unwrap();
        let outcome = task.execute(&ctx, false).await;
        assert_eq!(outcome.error().unwrap().kind, ErrorKind::Value);
    }
}
