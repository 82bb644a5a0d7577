use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::checkpoint::{
    record_execution_checkpoint, resolve_checkpoint, Checkpoint, CheckpointSchedule,
};
use crate::config::ExecutorConfig;
use crate::context::OperationContext;
use crate::error::MazepaError;
use crate::queue::ExecutionQueue;
use crate::state::ExecutionState;

use super::core::{new_execution_id, ExecutionSummary, ExecutionTarget};
use super::dryrun::estimate_task_count;

pub(super) async fn run(
    target: ExecutionTarget,
    config: &ExecutorConfig,
    queue: &dyn ExecutionQueue,
) -> Result<ExecutionSummary, MazepaError> {
    config.validate()?;
    let started = Instant::now();
    let execution_id = config.execution_id.clone().unwrap_or_else(new_execution_id);
    let mut summary = ExecutionSummary::new(execution_id.clone());

    let mut state = target.into_state()?;
    state.set_max_task_retry(config.max_task_retry);

    if let Some(path) = &config.checkpoint {
        let path = resolve_checkpoint(path)?;
        let checkpoint = Checkpoint::read(&path)?;
        info!(
            execution_id = %execution_id,
            checkpoint = %path.display(),
            from_execution = %checkpoint.execution_id,
            tasks = checkpoint.tasks.len(),
            "Resuming from checkpoint"
        );
        state.restore(checkpoint.into_ledger());
    }

    if config.do_dryrun_estimation {
        let estimated = estimate_task_count(state.root_flows().to_vec(), config.max_batch_len);
        info!(
            execution_id = %execution_id,
            estimated_tasks = estimated,
            "Dry run estimation finished"
        );
        summary.estimated_tasks = Some(estimated);
    }

    info!(
        execution_id = %execution_id,
        queue = queue.name(),
        max_batch_len = config.max_batch_len,
        "Execution starting"
    );

    let ctx = OperationContext::new(execution_id.clone());
    let mut schedule = CheckpointSchedule::new(config.checkpoint_interval());
    let result = drive(&mut state, queue, &ctx, config, &mut schedule, &mut summary).await;
    ctx.clear();

    summary.tasks_executed = state.settled_count().saturating_sub(state.restored_count());
    summary.tasks_skipped = state.restored_hits();
    summary.tasks_retried = state.retries();

    if schedule.is_enabled() {
        match record_execution_checkpoint(&config.checkpoint_dir, &execution_id, &state) {
            Ok(path) => {
                summary.checkpoints_written += 1;
                summary.last_checkpoint = Some(path);
            }
            Err(e) if result.is_ok() => return Err(e.into()),
            Err(e) => warn!(error = %e, "Final checkpoint failed after aborted run"),
        }
    }
    summary.elapsed_secs = started.elapsed().as_secs_f64();

    match result {
        Ok(()) => {
            info!(
                execution_id = %execution_id,
                executed = summary.tasks_executed,
                skipped = summary.tasks_skipped,
                retried = summary.tasks_retried,
                elapsed_secs = summary.elapsed_secs,
                "Execution finished"
            );
            Ok(summary)
        }
        Err(e) => {
            error!(execution_id = %execution_id, error = %e, "Execution aborted");
            Err(e)
        }
    }
}

async fn drive(
    state: &mut ExecutionState,
    queue: &dyn ExecutionQueue,
    ctx: &OperationContext,
    config: &ExecutorConfig,
    schedule: &mut CheckpointSchedule,
    summary: &mut ExecutionSummary,
) -> Result<(), MazepaError> {
    let gap = config.batch_gap_sleep();

    while !state.is_exhausted() {
        let batch = state.get_task_batch(config.max_batch_len)?;
        let pushed = batch.len();
        if pushed > 0 {
            debug!(tasks = pushed, queue = queue.name(), "Pushing task batch");
            queue.push_tasks(batch, ctx).await?;
            summary.tasks_submitted += pushed;
        }

        if !queue.is_local() {
            tokio::time::sleep(gap).await;
            summary.gap_sleeps += 1;
        }

        let max_pull = state.in_flight_count().max(1);
        let outcomes = queue.pull_task_outcomes(max_pull).await?;
        let received = outcomes.len();
        let applied = if received > 0 {
            state.update_with_outcomes(outcomes)?
        } else {
            0
        };

        if config.show_progress && applied > 0 {
            info!(
                execution_id = %summary.execution_id,
                settled = state.settled_count(),
                estimated = ?summary.estimated_tasks,
                in_flight = state.in_flight_count(),
                ready = state.ready_count(),
                "Progress"
            );
        }

        if schedule.is_due() {
            let path =
                record_execution_checkpoint(&config.checkpoint_dir, &summary.execution_id, state)?;
            summary.checkpoints_written += 1;
            summary.last_checkpoint = Some(path);
            schedule.mark();
        }

        if !state.is_exhausted() && state.in_flight_count() == 0 && state.ready_count() == 0 {
            return Err(MazepaError::Stalled(format!(
                "{} flows are waiting but no task is ready or in flight",
                state.running_flow_count()
            )));
        }
    }
    Ok(())
}
