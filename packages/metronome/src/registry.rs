//! Task handler registry.
//!
//! Maps a task's `func_reference` string to an async handler, so workers can
//! claim jobs from the store and dispatch them without knowing concrete
//! types. Registration happens at startup on nodes that execute jobs;
//! scheduling-only nodes can leave the registry empty.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use uuid::Uuid;

/// Context handed to a handler for one job execution.
#[derive(Debug, Clone)]
pub struct TaskInvocation {
    pub job_id: Uuid,
    pub task_id: String,
    pub schedule_id: Option<String>,
    pub scheduled_fire_time: Option<DateTime<Utc>>,
    pub args: serde_json::Value,
}

/// Type alias for the boxed async handler.
///
/// Handlers return a JSON value that becomes the job result's return value.
type BoxedHandler = Box<
    dyn Fn(TaskInvocation) -> Pin<Box<dyn Future<Output = Result<serde_json::Value>> + Send>>
        + Send
        + Sync,
>;

/// Registry mapping `func_reference` strings to handlers.
///
/// # Example
///
/// ```ignore
/// let registry = TaskRegistry::new();
/// registry.register("reports:rollup", |invocation| async move {
///     rollup(invocation.args).await?;
///     Ok(serde_json::Value::Null)
/// });
/// ```
#[derive(Default)]
pub struct TaskRegistry {
    handlers: RwLock<HashMap<String, BoxedHandler>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler receiving the raw [`TaskInvocation`].
    ///
    /// Re-registering a `func_reference` replaces the previous handler.
    pub fn register<F, Fut>(&self, func_reference: impl Into<String>, handler: F)
    where
        F: Fn(TaskInvocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        let boxed: BoxedHandler = Box::new(move |invocation| Box::pin(handler(invocation)));
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(func_reference.into(), boxed);
    }

    /// Register a handler taking typed arguments, deserialized from the job
    /// payload.
    pub fn register_typed<A, F, Fut>(&self, func_reference: impl Into<String>, handler: F)
    where
        A: DeserializeOwned + Send + 'static,
        F: Fn(A, TaskInvocation) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        let func_reference = func_reference.into();
        let reference_for_errors = func_reference.clone();
        self.register(func_reference, move |invocation: TaskInvocation| {
            let handler = handler.clone();
            let reference = reference_for_errors.clone();
            async move {
                let args: A = serde_json::from_value(invocation.args.clone())
                    .map_err(|e| anyhow!("failed to deserialize args for {reference:?}: {e}"))?;
                handler(args, invocation).await
            }
        });
    }

    pub fn is_registered(&self, func_reference: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(func_reference)
    }

    pub fn registered(&self) -> Vec<String> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Execute an invocation through the handler registered for
    /// `func_reference`.
    pub async fn execute(
        &self,
        func_reference: &str,
        invocation: TaskInvocation,
    ) -> Result<serde_json::Value> {
        // Grab the future under the lock, await it outside.
        let future = {
            let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            let handler = handlers
                .get(func_reference)
                .ok_or_else(|| anyhow!("no handler registered for {func_reference:?}"))?;
            handler(invocation)
        };
        future.await
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("registered", &self.registered())
            .finish()
    }
}
