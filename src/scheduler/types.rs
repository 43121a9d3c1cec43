//! Engine type definitions.
//!
//! This module contains error types, state enums, statistics, and command
//! types for the engine.

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::config::ConfigError;
use crate::core::model::{TaskSpec, TaskStatus, TaskSummary, ValidationError};
use crate::core::result::TaskResult;
use crate::core::serde_duration;
use crate::core::types::TaskId;
use crate::storage::{StorageError, TaskFilter};

/// Errors that can occur in the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Submission rejected.
    #[error("invalid task: {0}")]
    Validation(#[from] ValidationError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(StorageError),

    /// Task not found.
    #[error("task not found: {0}")]
    NotFound(TaskId),

    /// Channel error.
    #[error("channel error: {0}")]
    ChannelError(String),

    /// Engine settings rejected at start.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The engine no longer accepts work.
    #[error("engine is shutting down")]
    ShuttingDown,
}

impl From<StorageError> for EngineError {
    fn from(e: StorageError) -> Self {
        EngineError::Storage(e)
    }
}

/// State of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Accepting and dispatching work.
    Running,
    /// Draining in-flight work; submissions are rejected.
    ShuttingDown,
    /// Dispatcher has exited.
    Stopped,
}

/// Snapshot of engine counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineStats {
    /// Tasks in the store.
    pub total_tasks: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_priority: BTreeMap<String, usize>,
    pub by_kind: BTreeMap<String, usize>,
    /// Tasks waiting in the ready queue.
    pub queued: usize,
    /// Tasks currently assigned to workers.
    pub running: usize,
    pub pool_size: usize,
    /// Attempts finished since the engine started.
    pub successful_attempts: u64,
    pub failed_attempts: u64,
    /// Mean duration of finished attempts since the engine started.
    #[serde(with = "serde_duration::option")]
    pub average_duration: Option<Duration>,
}

/// Commands that can be sent to the engine.
pub(crate) enum EngineCommand {
    Submit {
        spec: TaskSpec,
        response: oneshot::Sender<Result<TaskId, EngineError>>,
    },
    Status {
        id: TaskId,
        response: oneshot::Sender<Result<TaskStatus, EngineError>>,
    },
    Result {
        id: TaskId,
        response: oneshot::Sender<Result<Option<TaskResult>, EngineError>>,
    },
    Cancel {
        id: TaskId,
        response: oneshot::Sender<Result<bool, EngineError>>,
    },
    List {
        filter: TaskFilter,
        response: oneshot::Sender<Result<Vec<TaskSummary>, EngineError>>,
    },
    Pause {
        id: TaskId,
        response: oneshot::Sender<Result<bool, EngineError>>,
    },
    Resume {
        id: TaskId,
        response: oneshot::Sender<Result<bool, EngineError>>,
    },
    Subscribe {
        id: TaskId,
        response: oneshot::Sender<Result<oneshot::Receiver<TaskResult>, EngineError>>,
    },
    Stats {
        response: oneshot::Sender<Result<EngineStats, EngineError>>,
    },
    Shutdown {
        response: oneshot::Sender<()>,
    },
}
