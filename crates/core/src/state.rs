//! The scheduler ledger: running flows, live tasks, the ready queue and the
//! record of settled outcomes.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::task::noop_waker_ref;
use tracing::{debug, warn};

use crate::error::{MazepaError, QueueError};
use crate::flow::{Flow, FlowContext, FlowFuture, FlowId, FlowIdAllocator, Yielded};
use crate::queue::OutcomeRecord;
use crate::task::{Task, TaskId, TaskOutcome, TaskStatus};

/// A task that reached its final status.
#[derive(Debug, Clone, PartialEq)]
pub struct SettledTask {
    pub operation_name: String,
    pub status: TaskStatus,
    pub outcome: TaskOutcome,
}

struct FlowEntry {
    name: Arc<str>,
    parent: Option<FlowId>,
    cx: FlowContext,
    /// `None` once the body has returned.
    body: Option<FlowFuture>,
    pending_tasks: HashSet<TaskId>,
    pending_children: HashSet<FlowId>,
}

impl FlowEntry {
    fn is_complete(&self) -> bool {
        self.body.is_none() && self.pending_tasks.is_empty() && self.pending_children.is_empty()
    }
}

struct TaskEntry {
    task: Task,
    owners: Vec<FlowId>,
    in_flight: bool,
}

/// Mutable state of one execution.
///
/// Only the executor loop touches it; worker code never does.
pub struct ExecutionState {
    roots: Vec<Flow>,
    started: bool,
    ids: FlowIdAllocator,
    flows: BTreeMap<FlowId, FlowEntry>,
    dirty: BTreeSet<FlowId>,
    tasks: HashMap<TaskId, TaskEntry>,
    ready: VecDeque<TaskId>,
    settled: HashMap<TaskId, SettledTask>,
    restored: HashSet<TaskId>,
    failed: HashSet<TaskId>,
    max_task_retry: u32,
    dry_run: bool,
    restored_hits: usize,
    retries: usize,
}

impl ExecutionState {
    pub fn new(flows: Vec<Flow>) -> Self {
        Self {
            roots: flows,
            started: false,
            ids: FlowIdAllocator::default(),
            flows: BTreeMap::new(),
            dirty: BTreeSet::new(),
            tasks: HashMap::new(),
            ready: VecDeque::new(),
            settled: HashMap::new(),
            restored: HashSet::new(),
            failed: HashSet::new(),
            max_task_retry: 1,
            dry_run: false,
            restored_hits: 0,
            retries: 0,
        }
    }

    pub fn with_max_task_retry(mut self, max_task_retry: u32) -> Self {
        self.max_task_retry = max_task_retry;
        self
    }

    pub fn set_max_task_retry(&mut self, max_task_retry: u32) {
        self.max_task_retry = max_task_retry;
    }

    /// Mark this state as a task-count estimate. Flow bodies see
    /// [`FlowContext::is_dry_run`], and a flow error ends only that flow.
    pub fn for_dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Seed the ledger with outcomes from a previous run. Tasks yielded later
    /// with one of these ids settle immediately instead of executing.
    pub fn restore(&mut self, entries: impl IntoIterator<Item = (TaskId, SettledTask)>) {
        for (id, settled) in entries {
            self.restored.insert(id.clone());
            self.settled.insert(id, settled);
        }
    }

    /// Root flow definitions, unstarted.
    pub fn root_flows(&self) -> &[Flow] {
        &self.roots
    }

    pub fn settled(&self) -> impl Iterator<Item = (&TaskId, &SettledTask)> {
        self.settled.iter()
    }

    pub fn settled_count(&self) -> usize {
        self.settled.len()
    }

    /// Entries loaded through [`ExecutionState::restore`].
    pub fn restored_count(&self) -> usize {
        self.restored.len()
    }

    /// Tasks yielded this run that were answered from the restored ledger.
    pub fn restored_hits(&self) -> usize {
        self.restored_hits
    }

    pub fn retries(&self) -> usize {
        self.retries
    }

    pub fn failed(&self) -> &HashSet<TaskId> {
        &self.failed
    }

    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.tasks.values().filter(|t| t.in_flight).count()
    }

    pub fn running_flow_count(&self) -> usize {
        self.flows.len()
    }

    /// True once every flow has completed and no task is live.
    pub fn is_exhausted(&self) -> bool {
        (self.started || self.roots.is_empty()) && self.flows.is_empty() && self.tasks.is_empty()
    }

    /// Resume flows until none can make progress.
    pub fn advance(&mut self) -> Result<(), MazepaError> {
        if !self.started {
            self.started = true;
            for root in self.roots.clone() {
                let id = self.ids.next();
                self.start_flow(id, &root, None);
            }
        }

        while let Some(id) = self.dirty.pop_first() {
            let Some(entry) = self.flows.get_mut(&id) else { continue };
            let Some(body) = entry.body.as_mut() else { continue };

            let poll = body.as_mut().poll(&mut Context::from_waker(noop_waker_ref()));
            let yielded = entry.cx.drain_yielded();
            match poll {
                Poll::Ready(Ok(())) => {
                    debug!(flow = %entry.name, flow_id = %id, "Flow body returned");
                    entry.body = None;
                }
                Poll::Ready(Err(source)) if self.dry_run => {
                    warn!(
                        flow = %entry.name,
                        flow_id = %id,
                        error = %source,
                        "Flow failed during dry run"
                    );
                    entry.body = None;
                }
                Poll::Ready(Err(source)) => {
                    return Err(MazepaError::Flow {
                        flow: entry.name.to_string(),
                        source,
                    });
                }
                Poll::Pending => {}
            }

            for item in yielded {
                match item {
                    Yielded::Task(task) => self.register_task(id, task),
                    Yielded::Flow(child_id, flow) => {
                        if let Some(parent) = self.flows.get_mut(&id) {
                            parent.pending_children.insert(child_id);
                        }
                        self.start_flow(child_id, &flow, Some(id));
                    }
                }
            }
            self.complete_flows_from(id);
        }
        Ok(())
    }

    /// Advance flows, then take up to `max_len` ready tasks and mark them in flight.
    pub fn get_task_batch(&mut self, max_len: usize) -> Result<Vec<Task>, MazepaError> {
        self.advance()?;

        let mut batch = Vec::with_capacity(max_len.min(self.ready.len()));
        while batch.len() < max_len {
            let Some(id) = self.ready.pop_front() else { break };
            if let Some(entry) = self.tasks.get_mut(&id) {
                entry.in_flight = true;
                entry.task.mark_running();
                batch.push(entry.task.clone());
            }
        }
        Ok(batch)
    }

    /// Apply outcomes pulled from a queue.
    ///
    /// Outcomes for unknown, already settled, or stale attempts are ignored,
    /// so applying the same record twice is a no-op. Returns the number of
    /// records applied, or the first fatal failure after all records have
    /// been processed.
    pub fn update_with_outcomes(
        &mut self,
        records: impl IntoIterator<Item = OutcomeRecord>,
    ) -> Result<usize, MazepaError> {
        let mut applied = 0;
        let mut fatal = None;

        for record in records {
            match self.apply_outcome(record) {
                Ok(true) => applied += 1,
                Ok(false) => {}
                Err(e) => {
                    applied += 1;
                    fatal.get_or_insert(e);
                }
            }
        }

        self.advance()?;
        match fatal {
            Some(e) => Err(e),
            None => Ok(applied),
        }
    }

    fn apply_outcome(&mut self, record: OutcomeRecord) -> Result<bool, MazepaError> {
        if !record.status.is_terminal() {
            return Err(QueueError::Parse(format!(
                "outcome for {} has non-terminal status {:?}",
                record.task_id, record.status
            ))
            .into());
        }
        let Some(entry) = self.tasks.get_mut(&record.task_id) else {
            debug!(task_id = %record.task_id, "Ignoring outcome for unknown or settled task");
            return Ok(false);
        };
        if !entry.in_flight || entry.task.attempts() != record.attempt {
            debug!(
                task_id = %record.task_id,
                attempt = record.attempt,
                "Ignoring stale outcome"
            );
            return Ok(false);
        }
        entry.in_flight = false;
        if !entry.task.settle(record.status, record.outcome.clone()) {
            return Ok(false);
        }

        match record.status {
            TaskStatus::Succeeded => {
                self.finish_task(&record.task_id, TaskStatus::Succeeded, record.outcome);
                Ok(true)
            }
            TaskStatus::TransientError if entry.task.attempts() < self.max_task_retry => {
                warn!(
                    task_id = %record.task_id,
                    operation = %entry.task.operation_name(),
                    attempt = entry.task.attempts() + 1,
                    max_task_retry = self.max_task_retry,
                    error = ?record.outcome.error(),
                    "Transient task error, resubmitting"
                );
                entry.task.reset_for_retry();
                self.ready.push_back(record.task_id);
                self.retries += 1;
                Ok(true)
            }
            TaskStatus::TransientError => {
                entry.task.escalate();
                let attempts = entry.task.attempts() + 1;
                let operation_name = entry.task.operation_name().to_string();
                self.failed.insert(record.task_id.clone());
                let error = record.outcome.error().cloned().unwrap_or_else(|| {
                    crate::task::TaskError::runtime("transient error without captured error")
                });
                Err(MazepaError::RetriesExhausted {
                    task_id: record.task_id,
                    operation_name,
                    attempts,
                    error,
                })
            }
            _ => {
                let operation_name = entry.task.operation_name().to_string();
                self.failed.insert(record.task_id.clone());
                let error = record.outcome.error().cloned().unwrap_or_else(|| {
                    crate::task::TaskError::runtime("task failed without captured error")
                });
                Err(MazepaError::TaskFailed {
                    task_id: record.task_id,
                    operation_name,
                    error,
                })
            }
        }
    }

    fn start_flow(&mut self, id: FlowId, flow: &Flow, parent: Option<FlowId>) {
        let (cx, body) = flow.instantiate(id, self.ids.clone(), self.dry_run);
        debug!(flow = %flow.name(), flow_id = %id, parent = ?parent, "Starting flow");
        self.flows.insert(
            id,
            FlowEntry {
                name: Arc::from(flow.name()),
                parent,
                cx,
                body: Some(body),
                pending_tasks: HashSet::new(),
                pending_children: HashSet::new(),
            },
        );
        self.dirty.insert(id);
    }

    fn register_task(&mut self, owner: FlowId, task: Task) {
        let id = task.id().clone();

        if let Some(settled) = self.settled.get(&id) {
            if self.restored.contains(&id) {
                self.restored_hits += 1;
            }
            if let Some(flow) = self.flows.get(&owner) {
                flow.cx.deliver_task(id, settled.status, settled.outcome.clone());
                self.dirty.insert(owner);
            }
            return;
        }

        if let Some(flow) = self.flows.get_mut(&owner) {
            flow.pending_tasks.insert(id.clone());
        }

        match self.tasks.get_mut(&id) {
            Some(live) => {
                if !live.owners.contains(&owner) {
                    live.owners.push(owner);
                }
            }
            None => {
                self.tasks.insert(
                    id.clone(),
                    TaskEntry {
                        task,
                        owners: vec![owner],
                        in_flight: false,
                    },
                );
                self.ready.push_back(id);
            }
        }
    }

    fn finish_task(&mut self, id: &TaskId, status: TaskStatus, outcome: TaskOutcome) {
        let Some(entry) = self.tasks.remove(id) else { return };
        for owner in &entry.owners {
            if let Some(flow) = self.flows.get_mut(owner) {
                flow.pending_tasks.remove(id);
                flow.cx.deliver_task(id.clone(), status, outcome.clone());
                self.dirty.insert(*owner);
            }
        }
        self.settled.insert(
            id.clone(),
            SettledTask {
                operation_name: entry.task.operation_name().to_string(),
                status,
                outcome,
            },
        );
        for owner in entry.owners {
            self.complete_flows_from(owner);
        }
    }

    /// Remove `id` if it is complete, then walk up through parents.
    fn complete_flows_from(&mut self, id: FlowId) {
        let mut current = Some(id);
        while let Some(id) = current.take() {
            let complete = self.flows.get(&id).is_some_and(FlowEntry::is_complete);
            if !complete {
                break;
            }
            let Some(entry) = self.flows.remove(&id) else { break };
            debug!(flow = %entry.name, flow_id = %id, "Flow complete");
            if let Some(parent_id) = entry.parent {
                if let Some(parent) = self.flows.get_mut(&parent_id) {
                    parent.pending_children.remove(&id);
                    parent.cx.deliver_flow(id);
                    self.dirty.insert(parent_id);
                }
                current = Some(parent_id);
            }
        }
    }
}

impl std::fmt::Debug for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionState")
            .field("roots", &self.roots.len())
            .field("running_flows", &self.flows.len())
            .field("live_tasks", &self.tasks.len())
            .field("ready", &self.ready.len())
            .field("settled", &self.settled.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::flow::{concurrent_flow, Dependency, FlowError};
    use crate::operation::TaskableOperation;
    use crate::task::{ErrorKind, TaskError};

    fn echo() -> TaskableOperation {
        TaskableOperation::from_fn("echo", |s: String| {
            Ok::<_, TaskError>(format!("return-for-{s}"))
        })
    }

    fn succeed(task: &Task) -> OutcomeRecord {
        OutcomeRecord {
            task_id: task.id().clone(),
            attempt: task.attempts(),
            status: TaskStatus::Succeeded,
            outcome: TaskOutcome::success(json!(format!("done-{}", task.id())), 0.0),
        }
    }

    fn two_step(name: &'static str) -> Flow {
        let op = echo();
        Flow::new(name, move |cx| {
            let op = op.clone();
            async move {
                let first = cx.submit(op.make_task(format!("{name}-x1"))?);
                cx.wait(Dependency::on(&first)).await?;
                cx.submit(op.make_task(format!("{name}-x2"))?);
                Ok(())
            }
        })
    }

    #[test]
    fn two_step_flow_releases_second_task_after_first() {
        let mut state = ExecutionState::new(vec![two_step("f1")]);

        let batch = state.get_task_batch(10).unwrap();
        assert_eq!(batch.len(), 1);
        assert!(state.get_task_batch(10).unwrap().is_empty());
        assert!(!state.is_exhausted());

        state.update_with_outcomes(vec![succeed(&batch[0])]).unwrap();
        let batch = state.get_task_batch(10).unwrap();
        assert_eq!(batch.len(), 1);

        state.update_with_outcomes(vec![succeed(&batch[0])]).unwrap();
        assert!(state.is_exhausted());
        assert_eq!(state.settled_count(), 2);
    }

    #[test]
    fn batch_len_limits_submission() {
        let op = echo();
        let flow = Flow::new("wide", move |cx| {
            let op = op.clone();
            async move {
                for i in 0..5 {
                    cx.submit(op.make_task(format!("t{i}"))?);
                }
                Ok(())
            }
        });
        let mut state = ExecutionState::new(vec![flow]);
        let first = state.get_task_batch(2).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(state.ready_count(), 3);
        assert_eq!(state.in_flight_count(), 2);
        for task in &first {
            assert_eq!(task.status(), TaskStatus::Running);
        }
    }

    #[test]
    fn duplicate_outcomes_are_ignored() {
        let mut state = ExecutionState::new(vec![two_step("f1")]);
        let batch = state.get_task_batch(10).unwrap();
        let record = succeed(&batch[0]);
        assert_eq!(state.update_with_outcomes(vec![record.clone()]).unwrap(), 1);
        assert_eq!(state.update_with_outcomes(vec![record]).unwrap(), 0);
        assert_eq!(state.settled_count(), 1);
    }

    #[test]
    fn transient_error_is_retried_then_escalated() {
        let mut state = ExecutionState::new(vec![two_step("f1")]).with_max_task_retry(1);
        let batch = state.get_task_batch(10).unwrap();
        let transient = |task: &Task| OutcomeRecord {
            task_id: task.id().clone(),
            attempt: task.attempts(),
            status: TaskStatus::TransientError,
            outcome: TaskOutcome::failure(TaskError::network("reset"), 0.0),
        };

        state.update_with_outcomes(vec![transient(&batch[0])]).unwrap();
        assert_eq!(state.retries(), 1);

        let retry = state.get_task_batch(10).unwrap();
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].attempts(), 1);

        // An outcome from the first attempt arriving late is stale.
        assert_eq!(state.update_with_outcomes(vec![transient(&batch[0])]).unwrap(), 0);

        let err = state.update_with_outcomes(vec![transient(&retry[0])]).unwrap_err();
        match err {
            MazepaError::RetriesExhausted { attempts, error, .. } => {
                assert_eq!(attempts, 2);
                assert_eq!(error.kind, ErrorKind::Network);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(state.failed().len(), 1);
    }

    #[test]
    fn fatal_failure_is_reported() {
        let mut state = ExecutionState::new(vec![two_step("f1")]);
        let batch = state.get_task_batch(10).unwrap();
        let err = state
            .update_with_outcomes(vec![OutcomeRecord {
                task_id: batch[0].id().clone(),
                attempt: 0,
                status: TaskStatus::Failed,
                outcome: TaskOutcome::failure(TaskError::value("bad"), 0.0),
            }])
            .unwrap_err();
        assert!(matches!(err, MazepaError::TaskFailed { .. }));
    }

    #[test]
    fn restored_tasks_settle_without_submission() {
        let mut scout = ExecutionState::new(vec![two_step("f1")]);
        let first = scout.get_task_batch(10).unwrap().remove(0);

        let mut state = ExecutionState::new(vec![two_step("f1")]);
        state.restore(vec![(
            first.id().clone(),
            SettledTask {
                operation_name: "echo".into(),
                status: TaskStatus::Succeeded,
                outcome: TaskOutcome::success(json!("return-for-f1-x1"), 0.0),
            },
        )]);

        let batch = state.get_task_batch(10).unwrap();
        assert_eq!(batch.len(), 1);
        assert_ne!(batch[0].id(), first.id());
        assert_eq!(state.restored_hits(), 1);
    }

    #[test]
    fn parent_waits_for_nested_flows() {
        let root = concurrent_flow(vec![two_step("a"), two_step("b")]);
        let mut state = ExecutionState::new(vec![root]);
        let batch = state.get_task_batch(10).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(state.running_flow_count(), 3);

        let records: Vec<_> = batch.iter().map(succeed).collect();
        state.update_with_outcomes(records).unwrap();
        let batch = state.get_task_batch(10).unwrap();
        assert_eq!(batch.len(), 2);
        assert!(!state.is_exhausted());

        let records: Vec<_> = batch.iter().map(succeed).collect();
        state.update_with_outcomes(records).unwrap();
        assert!(state.is_exhausted());
        assert_eq!(state.running_flow_count(), 0);
    }

    #[test]
    fn shared_task_ids_execute_once() {
        let op = echo();
        let make = |name: &'static str| {
            let op = op.clone();
            Flow::new(name, move |cx| {
                let op = op.clone();
                async move {
                    let shared = cx.submit(op.make_task("same")?);
                    cx.wait(Dependency::on(&shared)).await
                }
            })
        };
        let mut state = ExecutionState::new(vec![make("a"), make("b")]);
        let batch = state.get_task_batch(10).unwrap();
        assert_eq!(batch.len(), 1);
        state.update_with_outcomes(vec![succeed(&batch[0])]).unwrap();
        assert!(state.is_exhausted());
    }

    #[test]
    fn flow_error_aborts_advance() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let flow = Flow::new("broken", move |_cx| {
            seen.fetch_add(1, Ordering::SeqCst);
            async { Err(FlowError::failed("nope")) }
        });
        let mut state = ExecutionState::new(vec![flow]);
        let err = state.get_task_batch(1).unwrap_err();
        assert!(matches!(err, MazepaError::Flow { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_state_is_exhausted() {
        let mut state = ExecutionState::new(vec![]);
        assert!(state.is_exhausted());
        assert!(state.get_task_batch(1).unwrap().is_empty());
    }

    #[test]
    fn non_terminal_outcome_is_rejected() {
        let mut state = ExecutionState::new(vec![two_step("f1")]);
        let batch = state.get_task_batch(10).unwrap();
        let err = state
            .update_with_outcomes(vec![OutcomeRecord {
                task_id: batch[0].id().clone(),
                attempt: 0,
                status: TaskStatus::Running,
                outcome: TaskOutcome::dry_run(),
            }])
            .unwrap_err();
        assert!(matches!(err, MazepaError::Queue(QueueError::Parse(_))));
        assert_eq!(state.in_flight_count(), 1);
    }

    #[test]
    fn dry_run_flow_error_ends_only_that_flow() {
        let broken = Flow::new("broken", |_cx| async { Err(FlowError::failed("nope")) });
        let mut state = ExecutionState::new(vec![broken, two_step("f1")]).for_dry_run();
        assert!(state.is_dry_run());

        let batch = state.get_task_batch(10).unwrap();
        assert_eq!(batch.len(), 1);
        state.update_with_outcomes(vec![succeed(&batch[0])]).unwrap();
        let batch = state.get_task_batch(10).unwrap();
        assert_eq!(batch.len(), 1);
        state.update_with_outcomes(vec![succeed(&batch[0])]).unwrap();
        assert!(state.is_exhausted());
    }
}
