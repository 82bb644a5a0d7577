use std::collections::HashMap;

use tracing::{info, warn};

use crate::operation::TaskableOperation;
use crate::queue::TaskSpec;
use crate::task::Task;

/// Explicit name → operation table, populated at startup.
///
/// Remote workers use it to turn a [`TaskSpec`] back into a runnable [`Task`].
#[derive(Debug, Default, Clone)]
pub struct OperationRegistry {
    operations: HashMap<String, TaskableOperation>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation under its own name, replacing any previous one.
    pub fn register(&mut self, operation: TaskableOperation) -> Option<TaskableOperation> {
        let name = operation.name().to_string();
        info!(operation = %name, "Registered operation");
        let previous = self.operations.insert(name.clone(), operation);
        if previous.is_some() {
            warn!(operation = %name, "Replaced previously registered operation");
        }
        previous
    }

    pub fn with(mut self, operation: TaskableOperation) -> Self {
        self.register(operation);
        self
    }

    pub fn get(&self, name: &str) -> Option<&TaskableOperation> {
        self.operations.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.operations.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Rebuild a task from its wire form. `None` if the operation is unknown.
    pub fn task_from_spec(&self, spec: &TaskSpec) -> Option<Task> {
        let operation = self.get(&spec.operation_name)?;
        Some(Task::restore(
            operation.clone(),
            spec.task_id.clone(),
            spec.args.clone(),
            spec.attempt,
        ))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::task::TaskError;

    fn echo() -> TaskableOperation {
        TaskableOperation::from_fn("echo", |v: serde_json::Value| Ok::<_, TaskError>(v))
    }

    #[test]
    fn register_and_lookup() {
        let registry = OperationRegistry::new()
            .with(echo())
            .with(TaskableOperation::from_fn("add_one", |n: i64| Ok::<_, TaskError>(n + 1)));
        assert_eq!(registry.len(), 2);
        assert!(registry.contains("echo"));
        assert_eq!(registry.names(), vec!["add_one", "echo"]);
    }

    #[test]
    fn task_from_spec_keeps_identity() {
        let registry = OperationRegistry::new().with(echo());
        let original = echo().make_task(json!({"a": 1})).unwrap();
        let spec = TaskSpec::from_task(&original);

        let restored = registry.task_from_spec(&spec).unwrap();
        assert_eq!(restored.id(), original.id());
        assert_eq!(restored.args(), original.args());

        let mut unknown = spec.clone();
        unknown.operation_name = "missing".into();
        assert!(registry.task_from_spec(&unknown).is_none());
    }

    #[test]
    fn register_replaces() {
        let mut registry = OperationRegistry::new();
        assert!(registry.register(echo()).is_none());
        assert!(registry.register(echo()).is_some());
        assert_eq!(registry.len(), 1);
    }
}
