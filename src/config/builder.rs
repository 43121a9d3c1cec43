//! Batch submission of task files.
//!
//! This module turns a parsed [`TaskFile`] into engine submissions, resolving
//! `depends_on` keys into the ids the engine assigns.

use std::collections::HashMap;

use crate::core::types::TaskId;
use crate::scheduler::{EngineError, EngineHandle};

use super::types::TaskFile;
use super::yaml::YamlLoader;

/// Submit every task in `file`, dependencies first.
///
/// Returns `(key, id)` pairs in submission order. If a submission is
/// rejected, the tasks already submitted stay in the engine.
pub async fn submit_task_file(
    handle: &EngineHandle,
    file: &TaskFile,
) -> Result<Vec<(String, TaskId)>, EngineError> {
    let order = YamlLoader::dependency_order(file)?;
    let entries: HashMap<&str, _> = file
        .tasks
        .iter()
        .map(|entry| (entry.key.as_str(), entry))
        .collect();

    let mut ids: HashMap<&str, TaskId> = HashMap::new();
    let mut submitted = Vec::with_capacity(order.len());

    for key in order {
        let Some(entry) = entries.get(key) else {
            continue;
        };
        let mut spec = entry.spec.clone();
        if spec.name.is_empty() {
            spec.name = entry.key.clone();
        }
        for dep in &entry.depends_on {
            if let Some(id) = ids.get(dep.as_str()) {
                spec = spec.depends_on(id.clone());
            }
        }

        let id = handle.submit(spec).await?;
        tracing::debug!(key, task_id = %id, "Submitted task from file");
        ids.insert(key, id.clone());
        submitted.push((entry.key.clone(), id));
    }

    Ok(submitted)
}
