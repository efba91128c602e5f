use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;

use crate::domain::{Outcome, SyncError, Task, TaskType};

/// A handler for a specific task type.
///
/// Takes the claimed `Task` so the handler can read `data` as it likes and
/// heartbeat long work through the store. An `Err` is recorded as `Fail`.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> Result<Outcome, SyncError>;
}

/// Registry of handlers (task_type -> handler).
///
/// Built during initialization (mutable), shared read-only afterwards.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        task_type: TaskType,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), SyncError> {
        if self.handlers.contains_key(&task_type) {
            return Err(SyncError::DuplicateHandler(task_type));
        }
        self.handlers.insert(task_type, handler);
        Ok(())
    }

    pub fn get(&self, task_type: TaskType) -> Result<&Arc<dyn TaskHandler>, SyncError> {
        self.handlers
            .get(&task_type)
            .ok_or(SyncError::HandlerNotFound(task_type))
    }

    /// Registered types in a stable order.
    pub fn task_types(&self) -> Vec<TaskType> {
        let mut types: Vec<_> = self.handlers.keys().copied().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Run `handler` on `task`, turning errors and panics into `Fail`.
pub async fn run_handler(handler: &dyn TaskHandler, task: &Task) -> Outcome {
    match AssertUnwindSafe(handler.handle(task)).catch_unwind().await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => Outcome::fail(e.to_string()),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Outcome::fail(format!("handler panicked: {message}"))
        }
    }
}
