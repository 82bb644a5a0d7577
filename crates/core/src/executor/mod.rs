//! Executor: drives an [`ExecutionState`](crate::ExecutionState) to completion
//! against an [`ExecutionQueue`](crate::ExecutionQueue).
//!
//! Split into focused submodules:
//! - `core`: Executor struct, execution targets and the run summary
//! - `execution`: the push/sleep/pull loop, checkpointing and progress
//! - `dryrun`: task count estimation without executing anything

mod core;
mod dryrun;
mod execution;

pub use self::core::{new_execution_id, ExecutionSummary, ExecutionTarget, Executor};
pub use self::dryrun::estimate_task_count;

use crate::config::ExecutorConfig;
use crate::error::MazepaError;
use crate::queue::ExecutionQueue;

/// Run `target` to completion on `queue`.
///
/// Fatal task failures, flow errors and queue errors abort the run and are
/// returned as-is. When checkpointing is enabled a final checkpoint is written
/// whether the run succeeds or not.
pub async fn execute(
    target: impl Into<ExecutionTarget>,
    config: &ExecutorConfig,
    queue: &dyn ExecutionQueue,
) -> Result<ExecutionSummary, MazepaError> {
    execution::run(target.into(), config, queue).await
}
