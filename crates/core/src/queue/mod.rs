//! Where tasks actually run.

mod local;

pub use local::LocalExecutionQueue;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::OperationContext;
use crate::error::QueueError;
use crate::task::{Task, TaskId, TaskOutcome, TaskStatus};

/// Transport for task execution.
///
/// The executor pushes ready batches and pulls back outcomes; the queue never
/// owns tasks beyond the call that carries them.
#[async_trait]
pub trait ExecutionQueue: Send + Sync {
    /// Human-readable name for logging.
    fn name(&self) -> &str;

    /// True when tasks run in-process inside `push_tasks`.
    fn is_local(&self) -> bool;

    /// Hand a batch of running tasks to the backend.
    async fn push_tasks(&self, tasks: Vec<Task>, ctx: &OperationContext) -> Result<(), QueueError>;

    /// Collect up to `max_num` outcomes that have arrived since the last pull.
    async fn pull_task_outcomes(&self, max_num: usize) -> Result<Vec<OutcomeRecord>, QueueError>;
}

/// Wire form of a task on a work queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_id: TaskId,
    pub operation_name: String,
    pub args: Value,
    #[serde(default)]
    pub attempt: u32,
}

impl TaskSpec {
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id().clone(),
            operation_name: task.operation_name().to_string(),
            args: task.args().clone(),
            attempt: task.attempts(),
        }
    }

    pub fn to_json(&self) -> Result<String, QueueError> {
        serde_json::to_string(self).map_err(|e| QueueError::Encode(e.to_string()))
    }

    pub fn from_json(body: &str) -> Result<Self, QueueError> {
        serde_json::from_str(body).map_err(|e| QueueError::Parse(e.to_string()))
    }
}

/// Wire form of a finished attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub task_id: TaskId,
    #[serde(default)]
    pub attempt: u32,
    pub status: TaskStatus,
    pub outcome: TaskOutcome,
}

impl OutcomeRecord {
    /// Snapshot a task after it has executed. Tasks without an outcome are
    /// reported as a runtime failure.
    pub fn from_task(task: &Task) -> Self {
        let outcome = task.outcome().cloned().unwrap_or_else(|| {
            TaskOutcome::failure(crate::task::TaskError::runtime("task produced no outcome"), 0.0)
        });
        let status = if task.status().is_terminal() {
            task.status()
        } else {
            TaskStatus::Failed
        };
        Self {
            task_id: task.id().clone(),
            attempt: task.attempts(),
            status,
            outcome,
        }
    }

    /// A successful `null` outcome, used when estimating without executing.
    pub fn dry_run(task: &Task) -> Self {
        Self {
            task_id: task.id().clone(),
            attempt: task.attempts(),
            status: TaskStatus::Succeeded,
            outcome: TaskOutcome::dry_run(),
        }
    }

    pub fn to_json(&self) -> Result<String, QueueError> {
        serde_json::to_string(self).map_err(|e| QueueError::Encode(e.to_string()))
    }

    pub fn from_json(body: &str) -> Result<Self, QueueError> {
        serde_json::from_str(body).map_err(|e| QueueError::Parse(e.to_string()))
    }
}
