//! Scheduled task handlers.

use crate::failure::JobFailure;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::info;

/// Work run by the scheduler.
#[async_trait]
pub trait ScheduledTask: Send + Sync {
    /// Runs the task with its stored parameters. The returned value is
    /// recorded with the execution.
    async fn run(&self, parameters: &Value) -> Result<Value, JobFailure>;
}

/// Adapts an async closure to [`ScheduledTask`].
pub struct FnTask<F> {
    f: F,
}

impl<F> FnTask<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> ScheduledTask for FnTask<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, JobFailure>> + Send + 'static,
{
    async fn run(&self, parameters: &Value) -> Result<Value, JobFailure> {
        (self.f)(parameters.clone()).await
    }
}

/// Handlers for persistent scheduled jobs, keyed by `handler_class`.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, Arc<dyn ScheduledTask>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler_class: impl Into<String>, task: Arc<dyn ScheduledTask>) {
        let handler_class = handler_class.into();
        info!(handler = %handler_class, "Registered scheduled task handler");
        self.tasks.write().insert(handler_class, task);
    }

    /// Registers an async closure.
    pub fn register_fn<F, Fut>(&self, handler_class: impl Into<String>, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, JobFailure>> + Send + 'static,
    {
        self.register(handler_class, Arc::new(FnTask::new(f)));
    }

    pub fn get(&self, handler_class: &str) -> Option<Arc<dyn ScheduledTask>> {
        self.tasks.read().get(handler_class).cloned()
    }

    pub fn contains(&self, handler_class: &str) -> bool {
        self.tasks.read().contains_key(handler_class)
    }

    /// Registered handler names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_fn_task_receives_parameters() {
        let registry = TaskRegistry::new();
        registry.register_fn("Echo", |params| async move { Ok(params) });

        let task = registry.get("Echo").unwrap();
        let out = task.run(&json!({"days": 30})).await.unwrap();
        assert_eq!(out["days"], 30);
        assert!(registry.get("Missing").is_none());
        assert_eq!(registry.names(), vec!["Echo".to_string()]);
    }
}
