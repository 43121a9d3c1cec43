//! Lifecycle events and event handling.
//!
//! The engine emits an [`Event`] for every task state change it makes.
//! Handlers registered on the [`EventBus`] receive them in order.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::core::model::Priority;
use crate::core::result::FailureKind;
use crate::core::types::TaskId;

/// Lifecycle events emitted by the engine.
#[derive(Debug, Clone)]
pub enum Event {
    /// A task was admitted.
    TaskSubmitted {
        task_id: TaskId,
        name: String,
        priority: Priority,
        timestamp: Instant,
    },

    /// A task was handed to a worker.
    TaskStarted {
        task_id: TaskId,
        attempt: u32,
        timestamp: Instant,
    },

    /// A task completed successfully.
    TaskCompleted {
        task_id: TaskId,
        attempt: u32,
        duration: Duration,
        exit_code: Option<i32>,
        timestamp: Instant,
    },

    /// An attempt failed. Followed by `TaskRetrying` if budget remains.
    TaskFailed {
        task_id: TaskId,
        attempt: u32,
        failure: FailureKind,
        error: String,
        timestamp: Instant,
    },

    /// A failed task will run again after `delay`.
    ///
    /// `attempt` is the attempt about to run (1 for the first retry);
    /// `max_attempts` is the retry budget.
    TaskRetrying {
        task_id: TaskId,
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
        timestamp: Instant,
    },

    /// A task was cancelled.
    TaskCancelled { task_id: TaskId, timestamp: Instant },

    /// A queued task was paused.
    TaskPaused { task_id: TaskId, timestamp: Instant },

    /// A paused task was resumed.
    TaskResumed { task_id: TaskId, timestamp: Instant },

    /// A running task lost its worker and was put back in the queue.
    TaskRecovered {
        task_id: TaskId,
        reason: String,
        timestamp: Instant,
    },
}

impl Event {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> Instant {
        match self {
            Event::TaskSubmitted { timestamp, .. }
            | Event::TaskStarted { timestamp, .. }
            | Event::TaskCompleted { timestamp, .. }
            | Event::TaskFailed { timestamp, .. }
            | Event::TaskRetrying { timestamp, .. }
            | Event::TaskCancelled { timestamp, .. }
            | Event::TaskPaused { timestamp, .. }
            | Event::TaskResumed { timestamp, .. }
            | Event::TaskRecovered { timestamp, .. } => *timestamp,
        }
    }

    /// Task the event is about.
    pub fn task_id(&self) -> &TaskId {
        match self {
            Event::TaskSubmitted { task_id, .. }
            | Event::TaskStarted { task_id, .. }
            | Event::TaskCompleted { task_id, .. }
            | Event::TaskFailed { task_id, .. }
            | Event::TaskRetrying { task_id, .. }
            | Event::TaskCancelled { task_id, .. }
            | Event::TaskPaused { task_id, .. }
            | Event::TaskResumed { task_id, .. }
            | Event::TaskRecovered { task_id, .. } => task_id,
        }
    }

    pub fn task_submitted(task_id: TaskId, name: impl Into<String>, priority: Priority) -> Self {
        Event::TaskSubmitted {
            task_id,
            name: name.into(),
            priority,
            timestamp: Instant::now(),
        }
    }

    pub fn task_started(task_id: TaskId, attempt: u32) -> Self {
        Event::TaskStarted {
            task_id,
            attempt,
            timestamp: Instant::now(),
        }
    }

    pub fn task_completed(
        task_id: TaskId,
        attempt: u32,
        duration: Duration,
        exit_code: Option<i32>,
    ) -> Self {
        Event::TaskCompleted {
            task_id,
            attempt,
            duration,
            exit_code,
            timestamp: Instant::now(),
        }
    }

    pub fn task_failed(
        task_id: TaskId,
        attempt: u32,
        failure: FailureKind,
        error: impl Into<String>,
    ) -> Self {
        Event::TaskFailed {
            task_id,
            attempt,
            failure,
            error: error.into(),
            timestamp: Instant::now(),
        }
    }

    pub fn task_retrying(task_id: TaskId, attempt: u32, max_attempts: u32, delay: Duration) -> Self {
        Event::TaskRetrying {
            task_id,
            attempt,
            max_attempts,
            delay,
            timestamp: Instant::now(),
        }
    }

    pub fn task_cancelled(task_id: TaskId) -> Self {
        Event::TaskCancelled {
            task_id,
            timestamp: Instant::now(),
        }
    }

    pub fn task_paused(task_id: TaskId) -> Self {
        Event::TaskPaused {
            task_id,
            timestamp: Instant::now(),
        }
    }

    pub fn task_resumed(task_id: TaskId) -> Self {
        Event::TaskResumed {
            task_id,
            timestamp: Instant::now(),
        }
    }

    pub fn task_recovered(task_id: TaskId, reason: impl Into<String>) -> Self {
        Event::TaskRecovered {
            task_id,
            reason: reason.into(),
            timestamp: Instant::now(),
        }
    }
}

/// Handler for receiving lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &Event);
}

/// Event bus for distributing events to registered handlers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    /// Create a new event bus with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register an event handler.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
    }

    /// Emit an event to all registered handlers.
    pub async fn emit(&self, event: Event) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            handler.handle(&event).await;
        }
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
