//! Task handlers and the dispatch table

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value as JsonValue;
use std::sync::Arc;

use crate::scheduler::DelayedScheduler;
use crate::Result;

/// A task whose time has come
#[derive(Debug, Clone)]
pub struct FiredTask {
    pub key: String,
    pub task_type: String,
    /// Instant the task was scheduled for
    pub scheduled_for: DateTime<Utc>,
    /// Instant the timer actually fired (never earlier than `scheduled_for`)
    pub fired_at: DateTime<Utc>,
    pub payload: JsonValue,
}

/// Code run when a task of a given type fires
///
/// Delivery is at-least-once from the handler's point of view, so
/// implementations must tolerate running twice for the same key.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Task type this handler is registered under
    fn task_type(&self) -> &str;

    /// Run the task
    ///
    /// The scheduler is passed in so a handler can schedule follow-up tasks,
    /// including re-scheduling its own key.
    async fn run(&self, scheduler: &DelayedScheduler, task: FiredTask) -> Result<()>;
}

/// Mapping from task type to handler
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler
    ///
    /// If a handler with the same task type already exists, it will be replaced.
    pub fn register(&self, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(handler.task_type().to_string(), handler);
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).map(|h| Arc::clone(h.value()))
    }
}
