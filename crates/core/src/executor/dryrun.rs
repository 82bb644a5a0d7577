use tracing::{debug, warn};

use crate::flow::Flow;
use crate::queue::OutcomeRecord;
use crate::state::ExecutionState;

/// Count the tasks `roots` would submit, without executing any of them.
///
/// Flows are instantiated afresh in dry-run mode and every task settles
/// immediately as `Succeeded` with a `null` return value. Bodies that inspect
/// return values should consult [`FlowContext::is_dry_run`]. A flow that
/// fails anyway stops contributing, the others are still counted.
///
/// [`FlowContext::is_dry_run`]: crate::flow::FlowContext::is_dry_run
pub fn estimate_task_count(roots: Vec<Flow>, max_batch_len: usize) -> usize {
    let mut state = ExecutionState::new(roots).for_dry_run();
    let mut count = 0;
    let max_batch_len = max_batch_len.max(1);

    loop {
        let batch = match state.get_task_batch(max_batch_len) {
            Ok(batch) => batch,
            Err(e) => {
                warn!(error = %e, counted = count, "Dry run stopped early");
                return count;
            }
        };
        if batch.is_empty() {
            break;
        }
        count += batch.len();
        let records: Vec<OutcomeRecord> = batch.iter().map(OutcomeRecord::dry_run).collect();
        if let Err(e) = state.update_with_outcomes(records) {
            warn!(error = %e, counted = count, "Dry run stopped early");
            return count;
        }
    }

    if !state.is_exhausted() {
        debug!(counted = count, "Dry run ended with flows still waiting");
    }
    count
}
