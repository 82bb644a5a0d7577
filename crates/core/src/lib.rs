//! Task and flow execution engine.
//!
//! Work is described as [`Flow`]s that submit [`Task`]s and wait on
//! [`Dependency`] barriers. An [`ExecutionState`] tracks everything in flight
//! and [`execute`] drives it to completion against an [`ExecutionQueue`].

pub mod checkpoint;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod flow;
pub mod logging;
pub mod operation;
pub mod queue;
pub mod registry;
pub mod state;
pub mod task;

pub use checkpoint::{Checkpoint, CheckpointEntry};
pub use config::ExecutorConfig;
pub use context::OperationContext;
pub use error::*;
pub use executor::{
    estimate_task_count, execute, new_execution_id, ExecutionSummary, ExecutionTarget, Executor,
};
pub use flow::{
    concurrent_flow, Dependency, Flow, FlowContext, FlowError, FlowHandle, FlowId, FlowSchema,
    TaskHandle,
};
pub use operation::{Operation, TaskableOperation, TransientErrorCondition};
pub use queue::{ExecutionQueue, LocalExecutionQueue, OutcomeRecord, TaskSpec};
pub use registry::OperationRegistry;
pub use state::{ExecutionState, SettledTask};
pub use task::{ErrorKind, Task, TaskError, TaskId, TaskOutcome, TaskStatus};
