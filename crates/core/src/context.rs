use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

type Resource = Arc<dyn Any + Send + Sync>;

/// Per-run state handed to operations.
///
/// Holds resources that operations would otherwise keep in module-level
/// caches (client handles, opened backends, counters). The executor creates
/// one per run and clears it when the run ends.
pub struct OperationContext {
    execution_id: String,
    resources: RwLock<HashMap<String, Resource>>,
}

impl OperationContext {
    pub fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            resources: RwLock::new(HashMap::new()),
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Fetch the resource stored under `key`, if it exists and has type `T`.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let resources = self.resources.read().unwrap_or_else(PoisonError::into_inner);
        resources.get(key).cloned().and_then(|r| r.downcast::<T>().ok())
    }

    /// Fetch the resource under `key`, creating it with `init` on first use.
    ///
    /// Returns `None` if a resource of a different type already occupies `key`.
    pub fn get_or_insert_with<T, F>(&self, key: &str, init: F) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        if let Some(existing) = self.get::<T>(key) {
            return Some(existing);
        }
        let mut resources = self.resources.write().unwrap_or_else(PoisonError::into_inner);
        let entry = resources
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(init()) as Resource);
        Arc::clone(entry).downcast::<T>().ok()
    }

    pub fn len(&self) -> usize {
        self.resources.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached resource.
    pub fn clear(&self) {
        self.resources.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl std::fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationContext")
            .field("execution_id", &self.execution_id)
            .field("resources", &self.len())
            .finish()
    }
}
