//! Handler registry -- the mapping from task type to its executor.
//!
//! The registry is populated before the manager starts; the manager
//! snapshots it at start time, so later registrations do not affect a
//! running loop.

use std::collections::HashMap;
use std::sync::Arc;

use foreman_db::models::TaskType;

use super::trait_def::TaskHandler;

/// A collection of registered [`TaskHandler`] implementations, keyed by
/// the task type each one declares.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under the type returned by
    /// [`TaskHandler::task_type`].
    ///
    /// If a handler for the same type is already registered, it is replaced
    /// and the old one is returned.
    pub fn register(&mut self, handler: impl TaskHandler + 'static) -> Option<Arc<dyn TaskHandler>> {
        let task_type = handler.task_type();
        self.handlers.insert(task_type, Arc::new(handler))
    }

    /// Look up the handler for a task type.
    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&task_type).cloned()
    }

    /// List all registered task types.
    ///
    /// The order is not guaranteed (HashMap iteration order).
    pub fn list(&self) -> Vec<TaskType> {
        self.handlers.keys().copied().collect()
    }

    /// Return the number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Return `true` if no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
