//! Whole-store export and import.
//!
//! A [`StoreDump`] holds every task record and every attempt result of a
//! store as typed values, tagged with [`FORMAT_VERSION`]. Dumps move work
//! between backends (an in-memory run into SQLite) or between hosts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{FORMAT_VERSION, StorageError, TaskFilter, TaskStore};
use crate::core::model::Task;
use crate::core::result::TaskResult;

/// Snapshot of a store's tasks and results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreDump {
    pub format_version: i64,
    pub exported_at: DateTime<Utc>,
    /// Oldest first.
    pub tasks: Vec<Task>,
    /// Grouped by task, by attempt.
    pub results: Vec<TaskResult>,
}

/// Counts from [`StoreDump::import_into`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub tasks: usize,
    pub results: usize,
    /// Records already present in the target store.
    pub skipped: usize,
}

impl StoreDump {
    /// Read every task and result out of `store`.
    pub async fn export<S: TaskStore + ?Sized>(
        store: &S,
        exported_at: DateTime<Utc>,
    ) -> Result<Self, StorageError> {
        let tasks = store.list(&TaskFilter::all()).await?;
        let mut results = Vec::new();
        for task in &tasks {
            results.extend(store.list_results(&task.id).await?);
        }
        tracing::debug!(tasks = tasks.len(), results = results.len(), "Store exported");

        Ok(Self {
            format_version: FORMAT_VERSION,
            exported_at,
            tasks,
            results,
        })
    }

    /// Insert the dump's records into `store`.
    ///
    /// Tasks and results whose keys already exist are skipped, so importing
    /// the same dump twice is harmless. Tasks keep their recorded status; a
    /// task exported while Running is replayed when an engine next starts on
    /// the store.
    pub async fn import_into<S: TaskStore + ?Sized>(
        &self,
        store: &S,
    ) -> Result<ImportSummary, StorageError> {
        let mut summary = ImportSummary::default();
        for task in &self.tasks {
            match store.put(task.clone()).await {
                Ok(()) => summary.tasks += 1,
                Err(StorageError::DuplicateKey(key)) => {
                    tracing::debug!(key = %key, "Skipping existing task");
                    summary.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }
        for result in &self.results {
            match store.put_result(result.clone()).await {
                Ok(()) => summary.results += 1,
                Err(StorageError::DuplicateKey(_)) => summary.skipped += 1,
                Err(e) => return Err(e),
            }
        }
        tracing::info!(
            tasks = summary.tasks,
            results = summary.results,
            skipped = summary.skipped,
            "Store imported"
        );
        Ok(summary)
    }

    /// Pretty-printed JSON.
    pub fn to_json(&self) -> Result<String, StorageError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| StorageError::SerializationError(e.to_string()))
    }

    /// Parse a dump, rejecting ones written by a newer format.
    pub fn from_json(text: &str) -> Result<Self, StorageError> {
        let dump: StoreDump = serde_json::from_str(text)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;
        if dump.format_version > FORMAT_VERSION {
            return Err(StorageError::UnsupportedFormat {
                found: dump.format_version,
                supported: FORMAT_VERSION,
            });
        }
        Ok(dump)
    }
}
