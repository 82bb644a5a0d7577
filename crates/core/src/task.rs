//! Tasks: a named operation bound to arguments, plus its status and outcome.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::context::OperationContext;
use crate::operation::TaskableOperation;

/// Deterministic task identifier: `<operation_name>-<digest of args>`.
///
/// Replaying the same workflow produces the same ids, which is what lets a
/// checkpoint ledger skip work that already settled.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn for_invocation(operation_name: &str, args: &Value) -> Self {
        // serde_json objects are BTreeMap-backed, so this encoding is canonical.
        let encoded = serde_json::to_string(args).unwrap_or_default();
        let digest = Sha256::digest(encoded.as_bytes());
        let hex = format!("{digest:x}");
        Self(format!("{}-{}", operation_name, &hex[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle of a task.
///
/// `Succeeded`, `Failed` and `TransientError` are terminal for scheduling.
/// Only `TransientError` may go back to `Pending`, and only through a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TransientError,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::TransientError
        )
    }
}

/// Tag describing what went wrong inside an operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Bad input or output value.
    Value,
    Io,
    Network,
    Runtime,
    /// The runtime limit elapsed. Never transient.
    Timeout,
    /// The operation panicked.
    Panic,
    /// A worker received a task for an operation it does not know.
    UnknownOperation,
    Custom(String),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Value => f.write_str("value"),
            ErrorKind::Io => f.write_str("io"),
            ErrorKind::Network => f.write_str("network"),
            ErrorKind::Runtime => f.write_str("runtime"),
            ErrorKind::Timeout => f.write_str("timeout"),
            ErrorKind::Panic => f.write_str("panic"),
            ErrorKind::UnknownOperation => f.write_str("unknown-operation"),
            ErrorKind::Custom(name) => f.write_str(name),
        }
    }
}

/// Structured error captured from an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn value(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Value, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Runtime, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ErrorKind::Timeout
    }
}

/// Result of running a task. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub result: Result<Value, TaskError>,
    pub execution_secs: f64,
}

impl TaskOutcome {
    pub fn success(return_value: Value, execution_secs: f64) -> Self {
        Self {
            result: Ok(return_value),
            execution_secs,
        }
    }

    pub fn failure(error: TaskError, execution_secs: f64) -> Self {
        Self {
            result: Err(error),
            execution_secs,
        }
    }

    /// Outcome recorded for tasks that a dry run pretends to execute.
    pub fn dry_run() -> Self {
        Self::success(Value::Null, 0.0)
    }

    pub fn return_value(&self) -> Option<&Value> {
        self.result.as_ref().ok()
    }

    pub fn error(&self) -> Option<&TaskError> {
        self.result.as_ref().err()
    }
}

/// A unit of work: an operation bound to its arguments.
#[derive(Clone)]
pub struct Task {
    id: TaskId,
    operation: TaskableOperation,
    args: Value,
    status: TaskStatus,
    outcome: Option<TaskOutcome>,
    attempts: u32,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("operation_name", &self.operation_name())
            .field("status", &self.status)
            .field("attempts", &self.attempts)
            .finish()
    }
}

impl Task {
    pub(crate) fn new(operation: TaskableOperation, args: Value) -> Self {
        let id = TaskId::for_invocation(operation.name(), &args);
        Self {
            id,
            operation,
            args,
            status: TaskStatus::Pending,
            outcome: None,
            attempts: 0,
        }
    }

    /// Rebuild a task received over the wire, keeping its id and attempt count.
    pub fn restore(operation: TaskableOperation, id: TaskId, args: Value, attempts: u32) -> Self {
        Self {
            id,
            operation,
            args,
            status: TaskStatus::Pending,
            outcome: None,
            attempts,
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn operation_name(&self) -> &str {
        self.operation.name()
    }

    pub fn operation(&self) -> &TaskableOperation {
        &self.operation
    }

    pub fn args(&self) -> &Value {
        &self.args
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn outcome(&self) -> Option<&TaskOutcome> {
        self.outcome.as_ref()
    }

    /// Number of retries already spent on this task.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn mark_running(&mut self) {
        if !self.status.is_terminal() {
            self.status = TaskStatus::Running;
        }
    }

    /// Record an outcome. Ignored once the task is terminal.
    pub(crate) fn settle(&mut self, status: TaskStatus, outcome: TaskOutcome) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.outcome = Some(outcome);
        true
    }

    /// Move a transiently failed task back to `Pending` for another attempt.
    pub(crate) fn reset_for_retry(&mut self) -> bool {
        if self.status != TaskStatus::TransientError {
            return false;
        }
        self.status = TaskStatus::Pending;
        self.outcome = None;
        self.attempts += 1;
        true
    }

    /// Escalate an exhausted transient error to `Failed`.
    pub(crate) fn escalate(&mut self) {
        if self.status == TaskStatus::TransientError {
            self.status = TaskStatus::Failed;
        }
    }

    /// Run the bound operation and record the outcome.
    ///
    /// In `debug` mode the runtime limit is not enforced.
    pub async fn execute(&mut self, ctx: &OperationContext, debug: bool) -> &TaskOutcome {
        self.mark_running();
        debug!(task_id = %self.id, operation = %self.operation_name(), "executing task");

        let started = Instant::now();
        let result = self.operation.invoke(self.args.clone(), ctx, debug).await;
        let execution_secs = started.elapsed().as_secs_f64();

        let status = match &result {
            Ok(_) => TaskStatus::Succeeded,
            Err(e) => self.operation.classify(e),
        };
        self.status = status;
        self.outcome.insert(TaskOutcome {
            result,
            execution_secs,
        })
    }
}
