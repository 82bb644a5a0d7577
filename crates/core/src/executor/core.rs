use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::config::ExecutorConfig;
use crate::error::MazepaError;
use crate::flow::{Dependency, Flow};
use crate::operation::TaskableOperation;
use crate::queue::{ExecutionQueue, LocalExecutionQueue};
use crate::state::ExecutionState;
use crate::task::Task;

/// Fresh id of the form `exec-<12 hex chars>`.
pub fn new_execution_id() -> String {
    let slug = Uuid::new_v4().simple().to_string();
    format!("exec-{}", &slug[..12])
}

/// Anything `execute` accepts. All variants are normalised to an
/// [`ExecutionState`].
pub enum ExecutionTarget {
    Flows(Vec<Flow>),
    State(ExecutionState),
    Task(Task),
    /// A bare operation invoked once with the given arguments.
    Call(TaskableOperation, Value),
}

impl ExecutionTarget {
    pub fn call(operation: &TaskableOperation, args: impl Serialize) -> Result<Self, MazepaError> {
        Ok(Self::Call(operation.clone(), serde_json::to_value(args)?))
    }

    pub(crate) fn into_state(self) -> Result<ExecutionState, MazepaError> {
        let state = match self {
            Self::Flows(flows) => ExecutionState::new(flows),
            Self::State(state) => state,
            Self::Task(task) => ExecutionState::new(vec![single_task_flow(task)]),
            Self::Call(operation, args) => {
                let task = operation.make_task(args)?;
                ExecutionState::new(vec![single_task_flow(task)])
            }
        };
        Ok(state)
    }
}

fn single_task_flow(task: Task) -> Flow {
    let name = task.operation_name().to_string();
    Flow::new(name, move |cx| {
        let task = task.clone();
        async move {
            let handle = cx.submit(task);
            cx.wait(Dependency::on(&handle)).await
        }
    })
}

impl From<Flow> for ExecutionTarget {
    fn from(flow: Flow) -> Self {
        Self::Flows(vec![flow])
    }
}

impl From<Vec<Flow>> for ExecutionTarget {
    fn from(flows: Vec<Flow>) -> Self {
        Self::Flows(flows)
    }
}

impl From<ExecutionState> for ExecutionTarget {
    fn from(state: ExecutionState) -> Self {
        Self::State(state)
    }
}

impl From<Task> for ExecutionTarget {
    fn from(task: Task) -> Self {
        Self::Task(task)
    }
}

/// What a finished (or aborted) run did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionSummary {
    pub execution_id: String,
    /// Distinct tasks that settled during this run.
    pub tasks_executed: usize,
    /// Task pushes to the queue, retries included.
    pub tasks_submitted: usize,
    /// Tasks answered from a resumed checkpoint instead of running.
    pub tasks_skipped: usize,
    pub tasks_retried: usize,
    pub estimated_tasks: Option<usize>,
    pub gap_sleeps: usize,
    pub checkpoints_written: usize,
    pub last_checkpoint: Option<PathBuf>,
    pub elapsed_secs: f64,
}

impl ExecutionSummary {
    pub(crate) fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            ..Self::default()
        }
    }
}

/// Config plus a queue, for callers that run several targets the same way.
#[derive(Clone)]
pub struct Executor {
    config: ExecutorConfig,
    queue: Arc<dyn ExecutionQueue>,
}

impl Executor {
    pub fn new(config: ExecutorConfig, queue: Arc<dyn ExecutionQueue>) -> Self {
        info!(queue = queue.name(), local = queue.is_local(), "Executor created");
        Self { config, queue }
    }

    /// In-process executor with the given config.
    pub fn local(config: ExecutorConfig) -> Self {
        Self::new(config, Arc::new(LocalExecutionQueue::new()))
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<dyn ExecutionQueue> {
        &self.queue
    }

    pub async fn execute(
        &self,
        target: impl Into<ExecutionTarget>,
    ) -> Result<ExecutionSummary, MazepaError> {
        super::execute(target, &self.config, self.queue.as_ref()).await
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("config", &self.config)
            .field("queue", &self.queue.name())
            .finish()
    }
}
