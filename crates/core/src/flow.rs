//! Flows: cooperative routines that submit tasks and wait on dependencies.
//!
//! A flow body is an `async` block that receives a [`FlowContext`]. It submits
//! work through the context and suspends only at [`FlowContext::wait`]. The
//! execution state polls flow bodies itself with a no-op waker and re-polls a
//! flow whenever work it yielded settles, so a body must not await anything
//! other than the context's own futures.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::Poll;

use serde_json::Value;
use thiserror::Error;

use crate::error::MazepaError;
use crate::task::{Task, TaskId, TaskOutcome, TaskStatus};

pub type FlowFuture = Pin<Box<dyn Future<Output = Result<(), FlowError>> + Send>>;

type FlowFactory = dyn Fn(FlowContext) -> FlowFuture + Send + Sync;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("waited on {0}, which this flow never yielded")]
    UnknownDependency(String),

    #[error("could not create task: {0}")]
    TaskCreation(String),

    #[error("{0}")]
    Failed(String),
}

impl FlowError {
    pub fn failed(message: impl Into<String>) -> Self {
        FlowError::Failed(message.into())
    }
}

impl From<MazepaError> for FlowError {
    fn from(e: MazepaError) -> Self {
        FlowError::TaskCreation(e.to_string())
    }
}

/// Identifier of a running flow within one execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowId(u64);

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "flow-{}", self.0)
    }
}

/// Hands out flow ids for one execution state.
#[derive(Debug, Clone, Default)]
pub(crate) struct FlowIdAllocator(Arc<AtomicU64>);

impl FlowIdAllocator {
    pub(crate) fn next(&self) -> FlowId {
        FlowId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// A re-instantiable workflow definition.
///
/// Cloning a `Flow` clones the definition, not a running instance; each
/// execution state starts its own instance.
#[derive(Clone)]
pub struct Flow {
    name: Arc<str>,
    factory: Arc<FlowFactory>,
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow").field("name", &self.name).finish()
    }
}

impl Flow {
    pub fn new<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(FlowContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), FlowError>> + Send + 'static,
    {
        Self {
            name: Arc::from(name.into()),
            factory: Arc::new(move |cx| Box::pin(body(cx)) as FlowFuture),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn instantiate(
        &self,
        id: FlowId,
        ids: FlowIdAllocator,
        dry_run: bool,
    ) -> (FlowContext, FlowFuture) {
        let cx = FlowContext {
            id,
            name: Arc::clone(&self.name),
            ids,
            dry_run,
            shared: Arc::new(Mutex::new(FlowShared::default())),
        };
        let future = (self.factory)(cx.clone());
        (cx, future)
    }
}

/// A named flow template; every [`FlowSchema::call`] yields a fresh [`Flow`].
pub struct FlowSchema<A> {
    name: Arc<str>,
    body: Arc<dyn Fn(FlowContext, A) -> FlowFuture + Send + Sync>,
}

impl<A> Clone for FlowSchema<A> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            body: Arc::clone(&self.body),
        }
    }
}

impl<A: Clone + Send + Sync + 'static> FlowSchema<A> {
    pub fn new<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(FlowContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), FlowError>> + Send + 'static,
    {
        Self {
            name: Arc::from(name.into()),
            body: Arc::new(move |cx, args| Box::pin(body(cx, args)) as FlowFuture),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, args: A) -> Flow {
        let body = Arc::clone(&self.body);
        Flow {
            name: Arc::clone(&self.name),
            factory: Arc::new(move |cx| body(cx, args.clone())),
        }
    }
}

/// Compose flows so they run interleaved; completes once all of them have.
pub fn concurrent_flow(flows: Vec<Flow>) -> Flow {
    let flows: Arc<[Flow]> = Arc::from(flows);
    Flow::new("concurrent_flow", move |cx| {
        let flows = Arc::clone(&flows);
        async move {
            let handles: Vec<FlowHandle> = flows.iter().map(|f| cx.spawn(f.clone())).collect();
            cx.wait(Dependency::on_flows(&handles)).await
        }
    })
}

/// Reference to a task submitted by a flow.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    id: TaskId,
    operation_name: String,
}

impl TaskHandle {
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn operation_name(&self) -> &str {
        &self.operation_name
    }
}

/// Reference to a child flow spawned by a flow.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowHandle {
    id: FlowId,
    name: String,
}

impl FlowHandle {
    pub fn id(&self) -> FlowId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A barrier over tasks and child flows.
///
/// [`Dependency::all`] waits on everything the flow has yielded so far.
#[derive(Debug, Clone, Default)]
pub struct Dependency {
    tasks: Vec<TaskId>,
    flows: Vec<FlowId>,
    all: bool,
}

impl Dependency {
    pub fn on(task: &TaskHandle) -> Self {
        Self::default().and_task(task)
    }

    pub fn on_tasks<'a>(tasks: impl IntoIterator<Item = &'a TaskHandle>) -> Self {
        tasks.into_iter().fold(Self::default(), Self::and_task)
    }

    pub fn on_flow(flow: &FlowHandle) -> Self {
        Self::default().and_flow(flow)
    }

    pub fn on_flows<'a>(flows: impl IntoIterator<Item = &'a FlowHandle>) -> Self {
        flows.into_iter().fold(Self::default(), Self::and_flow)
    }

    pub fn all() -> Self {
        Self {
            all: true,
            ..Self::default()
        }
    }

    pub fn and_task(mut self, task: &TaskHandle) -> Self {
        self.tasks.push(task.id.clone());
        self
    }

    pub fn and_flow(mut self, flow: &FlowHandle) -> Self {
        self.flows.push(flow.id);
        self
    }
}

pub(crate) enum Yielded {
    Task(Task),
    Flow(FlowId, Flow),
}

#[derive(Default)]
pub(crate) struct FlowShared {
    yielded: Vec<Yielded>,
    submitted_tasks: Vec<TaskId>,
    submitted_set: HashSet<TaskId>,
    spawned_flows: Vec<FlowId>,
    spawned_set: HashSet<FlowId>,
    settled_tasks: HashMap<TaskId, (TaskStatus, TaskOutcome)>,
    finished_flows: HashSet<FlowId>,
}

/// The handle a flow body uses to yield work and wait on it.
#[derive(Clone)]
pub struct FlowContext {
    id: FlowId,
    name: Arc<str>,
    ids: FlowIdAllocator,
    dry_run: bool,
    shared: Arc<Mutex<FlowShared>>,
}

impl fmt::Debug for FlowContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowContext")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl FlowContext {
    fn lock(&self) -> MutexGuard<'_, FlowShared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> FlowId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True while the executor is only counting tasks. Every task then
    /// settles as `Succeeded` with a `null` return value.
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Submit a task without creating a barrier.
    pub fn submit(&self, task: Task) -> TaskHandle {
        let handle = TaskHandle {
            id: task.id().clone(),
            operation_name: task.operation_name().to_string(),
        };
        let mut shared = self.lock();
        if shared.submitted_set.insert(handle.id.clone()) {
            shared.submitted_tasks.push(handle.id.clone());
        }
        shared.yielded.push(Yielded::Task(task));
        handle
    }

    pub fn submit_all(&self, tasks: impl IntoIterator<Item = Task>) -> Vec<TaskHandle> {
        tasks.into_iter().map(|t| self.submit(t)).collect()
    }

    /// Start a nested flow. This flow does not complete before the child does.
    pub fn spawn(&self, flow: Flow) -> FlowHandle {
        let id = self.ids.next();
        let handle = FlowHandle {
            id,
            name: flow.name().to_string(),
        };
        let mut shared = self.lock();
        shared.spawned_flows.push(id);
        shared.spawned_set.insert(id);
        shared.yielded.push(Yielded::Flow(id, flow));
        handle
    }

    /// Suspend until every task and flow in `dependency` is terminal.
    pub async fn wait(&self, dependency: Dependency) -> Result<(), FlowError> {
        let (mut tasks, mut flows) = {
            let shared = self.lock();
            if dependency.all {
                (shared.submitted_tasks.clone(), shared.spawned_flows.clone())
            } else {
                let unknown_task = dependency
                    .tasks
                    .iter()
                    .find(|t| !shared.submitted_set.contains(*t));
                if let Some(unknown) = unknown_task {
                    return Err(FlowError::UnknownDependency(format!("task {unknown}")));
                }
                let unknown_flow = dependency
                    .flows
                    .iter()
                    .find(|f| !shared.spawned_set.contains(*f));
                if let Some(unknown) = unknown_flow {
                    return Err(FlowError::UnknownDependency(unknown.to_string()));
                }
                (dependency.tasks, dependency.flows)
            }
        };

        // Settled entries are dropped so each poll only rechecks what is left.
        futures::future::poll_fn(|_| {
            let shared = self.lock();
            tasks.retain(|t| !shared.settled_tasks.contains_key(t));
            flows.retain(|f| !shared.finished_flows.contains(f));
            if tasks.is_empty() && flows.is_empty() {
                Poll::Ready(Ok(()))
            } else {
                Poll::Pending
            }
        })
        .await
    }

    /// Current status of a submitted task as seen by this flow.
    pub fn status(&self, task: &TaskHandle) -> TaskStatus {
        self.lock()
            .settled_tasks
            .get(&task.id)
            .map(|(status, _)| *status)
            .unwrap_or(TaskStatus::Pending)
    }

    pub fn outcome(&self, task: &TaskHandle) -> Option<TaskOutcome> {
        self.lock().settled_tasks.get(&task.id).map(|(_, o)| o.clone())
    }

    pub fn return_value(&self, task: &TaskHandle) -> Option<Value> {
        self.outcome(task).and_then(|o| o.result.ok())
    }

    pub fn is_finished(&self, flow: &FlowHandle) -> bool {
        self.lock().finished_flows.contains(&flow.id)
    }

    pub(crate) fn drain_yielded(&self) -> Vec<Yielded> {
        std::mem::take(&mut self.lock().yielded)
    }

    pub(crate) fn deliver_task(&self, id: TaskId, status: TaskStatus, outcome: TaskOutcome) {
        self.lock().settled_tasks.insert(id, (status, outcome));
    }

    pub(crate) fn deliver_flow(&self, id: FlowId) {
        self.lock().finished_flows.insert(id);
    }
}
