//! Storage abstraction for persisting tasks and their results.
//!
//! This module provides a trait-based storage abstraction with
//! pluggable backends (in-memory, SQLite).
//!
//! [`TaskStore::update_status`] is the only way to change a stored task's
//! status. It is a compare-and-set, so two writers racing on the same task
//! cannot both win a transition.

mod dump;
mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use dump::{ImportSummary, StoreDump};
pub use memory::InMemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::model::{Priority, Task, TaskKind, TaskStatus};
use crate::core::result::TaskResult;
use crate::core::types::TaskId;

/// Version of the persisted record encoding.
pub const FORMAT_VERSION: i64 = 1;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A duplicate key was detected.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Storage lock was poisoned.
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Record written by a newer version of the format.
    #[error("unsupported record format version {found} (supported: {supported})")]
    UnsupportedFormat { found: i64, supported: i64 },

    /// Generic storage error.
    #[error("storage error: {0}")]
    Other(String),
}

/// Non-status fields the scheduler updates as a task progresses.
///
/// `None` leaves a field unchanged; `Some(None)` clears an optional field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub retry_count: Option<u32>,
    pub scheduled_time: Option<Option<DateTime<Utc>>>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
}

impl TaskPatch {
    /// Empty patch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the retry counter.
    pub fn retry_count(mut self, count: u32) -> Self {
        self.retry_count = Some(count);
        self
    }

    /// Set or clear the scheduled time.
    pub fn scheduled_time(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.scheduled_time = Some(at);
        self
    }

    /// Set or clear the start time.
    pub fn started_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.started_at = Some(at);
        self
    }

    /// Set or clear the completion time.
    pub fn completed_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.completed_at = Some(at);
        self
    }

    /// Apply to a task record. Never touches `status`.
    pub fn apply(&self, task: &mut Task) {
        if let Some(count) = self.retry_count {
            task.retry_count = count;
        }
        if let Some(at) = self.scheduled_time {
            task.scheduled_time = at;
        }
        if let Some(at) = self.started_at {
            task.started_at = at;
        }
        if let Some(at) = self.completed_at {
            task.completed_at = at;
        }
    }
}

/// Criteria for listing tasks. Empty criteria match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskFilter {
    /// Match any of these statuses.
    pub statuses: Vec<TaskStatus>,
    pub priority: Option<Priority>,
    pub kind: Option<TaskKind>,
    pub tag: Option<String>,
    /// Case-insensitive substring of the task name.
    pub name_contains: Option<String>,
    pub limit: Option<usize>,
}

impl TaskFilter {
    /// Match everything.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_kind(mut self, kind: TaskKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_name(mut self, fragment: impl Into<String>) -> Self {
        self.name_contains = Some(fragment.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `task` satisfies every criterion (ignores `limit`).
    pub fn matches(&self, task: &Task) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&task.status) {
            return false;
        }
        if self.priority.is_some_and(|p| p != task.priority) {
            return false;
        }
        if self.kind.is_some_and(|k| k != task.task_kind()) {
            return false;
        }
        if let Some(tag) = &self.tag {
            if !task.tags.iter().any(|t| t == tag) {
                return false;
            }
        }
        if let Some(fragment) = &self.name_contains {
            if !task.name.to_lowercase().contains(&fragment.to_lowercase()) {
                return false;
            }
        }
        true
    }
}

/// Durable store for tasks and per-attempt results.
#[async_trait]
pub trait TaskStore: Send + Sync {
    // Task operations

    /// Insert a new task. Fails with `DuplicateKey` if the id exists.
    async fn put(&self, task: Task) -> Result<(), StorageError>;

    /// Get a task by ID.
    async fn get(&self, id: &TaskId) -> Result<Task, StorageError>;

    /// Atomically move a task from `from` to `to`.
    ///
    /// Returns `Ok(false)` if the task's current status is not `from`.
    async fn update_status(
        &self,
        id: &TaskId,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<bool, StorageError>;

    /// Update non-status bookkeeping fields.
    async fn patch(&self, id: &TaskId, patch: TaskPatch) -> Result<(), StorageError>;

    /// List tasks matching `filter`, oldest first.
    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, StorageError>;

    /// All tasks currently in `status`, oldest first.
    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, StorageError> {
        self.list(&TaskFilter::all().with_status(status)).await
    }

    /// Delete a task and all of its results.
    async fn delete(&self, id: &TaskId) -> Result<(), StorageError>;

    // Result operations

    /// Record the result of one attempt. Results are immutable per attempt.
    async fn put_result(&self, result: TaskResult) -> Result<(), StorageError>;

    /// Result of the highest attempt, if any attempt finished.
    async fn latest_result(&self, id: &TaskId) -> Result<Option<TaskResult>, StorageError>;

    /// All results for a task, by attempt.
    async fn list_results(&self, id: &TaskId) -> Result<Vec<TaskResult>, StorageError>;
}
