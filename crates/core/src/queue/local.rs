use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use super::{ExecutionQueue, OutcomeRecord};
use crate::context::OperationContext;
use crate::error::QueueError;
use crate::task::Task;

/// Runs tasks in-process, one after another, inside `push_tasks`.
///
/// Outcomes are buffered until the executor pulls them.
#[derive(Debug, Default)]
pub struct LocalExecutionQueue {
    debug: bool,
    outcomes: Mutex<VecDeque<OutcomeRecord>>,
}

impl LocalExecutionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Debug mode skips runtime limits so tasks can be stepped through.
    pub fn debug() -> Self {
        Self {
            debug: true,
            ..Self::default()
        }
    }

    pub fn is_debug(&self) -> bool {
        self.debug
    }

    /// Outcomes waiting to be pulled.
    pub fn buffered(&self) -> usize {
        self.outcomes.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl ExecutionQueue for LocalExecutionQueue {
    fn name(&self) -> &str {
        "local"
    }

    fn is_local(&self) -> bool {
        true
    }

    async fn push_tasks(&self, tasks: Vec<Task>, ctx: &OperationContext) -> Result<(), QueueError> {
        let mut records = Vec::with_capacity(tasks.len());
        for mut task in tasks {
            task.execute(ctx, self.debug).await;
            debug!(task_id = %task.id(), status = ?task.status(), "Local task finished");
            records.push(OutcomeRecord::from_task(&task));
        }
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(records);
        Ok(())
    }

    async fn pull_task_outcomes(&self, max_num: usize) -> Result<Vec<OutcomeRecord>, QueueError> {
        let mut outcomes = self.outcomes.lock().unwrap_or_else(PoisonError::into_inner);
        let n = max_num.min(outcomes.len());
        Ok(outcomes.drain(..n).collect())
    }
}
