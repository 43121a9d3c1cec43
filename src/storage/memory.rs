//! In-memory storage implementation.
//!
//! Provides a thread-safe in-memory backend for testing and development.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use super::{StorageError, TaskFilter, TaskPatch, TaskStore};
use crate::core::model::{Task, TaskStatus};
use crate::core::result::TaskResult;
use crate::core::types::TaskId;

/// In-memory storage backend.
///
/// Thread-safe storage using RwLock for concurrent access.
/// Data is not persisted across restarts.
pub struct InMemoryStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
    results: RwLock<HashMap<TaskId, BTreeMap<u32, TaskResult>>>,
}

impl InMemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            results: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryStore {
    async fn put(&self, task: Task) -> Result<(), StorageError> {
        let mut tasks = self.tasks.write().map_err(|_| StorageError::LockPoisoned)?;
        if tasks.contains_key(&task.id) {
            return Err(StorageError::DuplicateKey(format!("task: {}", task.id)));
        }
        tasks.insert(task.id.clone(), task);
        Ok(())
    }

    async fn get(&self, id: &TaskId) -> Result<Task, StorageError> {
        let tasks = self.tasks.read().map_err(|_| StorageError::LockPoisoned)?;
        tasks
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("task: {}", id)))
    }

    async fn update_status(
        &self,
        id: &TaskId,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<bool, StorageError> {
        let mut tasks = self.tasks.write().map_err(|_| StorageError::LockPoisoned)?;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("task: {}", id)))?;
        if task.status != from {
            return Ok(false);
        }
        task.status = to;
        Ok(true)
    }

    async fn patch(&self, id: &TaskId, patch: TaskPatch) -> Result<(), StorageError> {
        let mut tasks = self.tasks.write().map_err(|_| StorageError::LockPoisoned)?;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("task: {}", id)))?;
        patch.apply(task);
        Ok(())
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, StorageError> {
        let tasks = self.tasks.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut result: Vec<_> = tasks.values().filter(|t| filter.matches(t)).cloned().collect();
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }
        Ok(result)
    }

    async fn delete(&self, id: &TaskId) -> Result<(), StorageError> {
        let mut tasks = self.tasks.write().map_err(|_| StorageError::LockPoisoned)?;
        tasks
            .remove(id)
            .ok_or_else(|| StorageError::NotFound(format!("task: {}", id)))?;
        let mut results = self.results.write().map_err(|_| StorageError::LockPoisoned)?;
        results.remove(id);
        Ok(())
    }

    async fn put_result(&self, result: TaskResult) -> Result<(), StorageError> {
        let mut results = self.results.write().map_err(|_| StorageError::LockPoisoned)?;
        let attempts = results.entry(result.task_id.clone()).or_default();
        if attempts.contains_key(&result.attempt) {
            return Err(StorageError::DuplicateKey(format!(
                "result: {}/{}",
                result.task_id, result.attempt
            )));
        }
        attempts.insert(result.attempt, result);
        Ok(())
    }

    async fn latest_result(&self, id: &TaskId) -> Result<Option<TaskResult>, StorageError> {
        let results = self.results.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(results
            .get(id)
            .and_then(|attempts| attempts.values().next_back())
            .cloned())
    }

    async fn list_results(&self, id: &TaskId) -> Result<Vec<TaskResult>, StorageError> {
        let results = self.results.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(results
            .get(id)
            .map(|attempts| attempts.values().cloned().collect())
            .unwrap_or_default())
    }
}
