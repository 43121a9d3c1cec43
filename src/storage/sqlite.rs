//! SQLite storage implementation.
//!
//! Provides persistent storage using SQLite database. Each task and result
//! is stored as a JSON record next to the indexed columns the store queries
//! on, tagged with [`FORMAT_VERSION`].

use async_trait::async_trait;
use chrono::SecondsFormat;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

use super::{FORMAT_VERSION, StorageError, TaskFilter, TaskPatch, TaskStore};
use crate::core::model::{Task, TaskStatus};
use crate::core::result::TaskResult;
use crate::core::types::TaskId;

/// SQLite storage backend.
///
/// Provides persistent storage with automatic schema migration.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and run migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(|e| StorageError::Other(e.to_string()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory SQLite database (useful for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Run database migrations. Safe to run repeatedly.
    async fn run_migrations(&self) -> Result<(), StorageError> {
        let schema = include_str!("../../migrations/001_initial_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(format!("migration failed: {}", e)))?;
        Ok(())
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn db_err(e: sqlx::Error) -> StorageError {
    StorageError::Other(e.to_string())
}

fn timestamp(at: chrono::DateTime<chrono::Utc>) -> String {
    // Fixed-width so that text ordering matches time ordering.
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn check_version(found: i64) -> Result<(), StorageError> {
    if found > FORMAT_VERSION {
        return Err(StorageError::UnsupportedFormat {
            found,
            supported: FORMAT_VERSION,
        });
    }
    Ok(())
}

fn encode<T: serde::Serialize>(value: &T) -> Result<String, StorageError> {
    serde_json::to_string(value).map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn decode_task(status: &str, version: i64, record: &str) -> Result<Task, StorageError> {
    check_version(version)?;
    let mut task: Task =
        serde_json::from_str(record).map_err(|e| StorageError::SerializationError(e.to_string()))?;
    task.status = status.parse().map_err(StorageError::SerializationError)?;
    Ok(task)
}

fn decode_result(version: i64, record: &str) -> Result<TaskResult, StorageError> {
    check_version(version)?;
    serde_json::from_str(record).map_err(|e| StorageError::SerializationError(e.to_string()))
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn put(&self, task: Task) -> Result<(), StorageError> {
        let record = encode(&task)?;
        let result = sqlx::query(
            r#"
            INSERT INTO tasks (id, name, status, priority, kind, created_at, format_version, record)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(task.id.as_str())
        .bind(&task.name)
        .bind(task.status.as_str())
        .bind(task.priority.level())
        .bind(task.task_kind().as_str())
        .bind(timestamp(task.created_at))
        .bind(FORMAT_VERSION)
        .bind(record)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StorageError::DuplicateKey(format!("task: {}", task.id)))
            }
            Err(e) => Err(db_err(e)),
        }
    }

    async fn get(&self, id: &TaskId) -> Result<Task, StorageError> {
        let row: (String, i64, String) =
            sqlx::query_as("SELECT status, format_version, record FROM tasks WHERE id = ?")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?
                .ok_or_else(|| StorageError::NotFound(format!("task: {}", id)))?;

        decode_task(&row.0, row.1, &row.2)
    }

    async fn update_status(
        &self,
        id: &TaskId,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query("UPDATE tasks SET status = ? WHERE id = ? AND status = ?")
            .bind(to.as_str())
            .bind(id.as_str())
            .bind(from.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        let exists: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM tasks WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        match exists {
            Some(_) => Ok(false),
            None => Err(StorageError::NotFound(format!("task: {}", id))),
        }
    }

    async fn patch(&self, id: &TaskId, patch: TaskPatch) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row: (String, i64, String) =
            sqlx::query_as("SELECT status, format_version, record FROM tasks WHERE id = ?")
                .bind(id.as_str())
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?
                .ok_or_else(|| StorageError::NotFound(format!("task: {}", id)))?;

        let mut task = decode_task(&row.0, row.1, &row.2)?;
        patch.apply(&mut task);

        sqlx::query("UPDATE tasks SET format_version = ?, record = ? WHERE id = ?")
            .bind(FORMAT_VERSION)
            .bind(encode(&task)?)
            .bind(id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, StorageError> {
        let mut sql = String::from("SELECT status, format_version, record FROM tasks");
        if !filter.statuses.is_empty() {
            let placeholders = vec!["?"; filter.statuses.len()].join(", ");
            sql.push_str(&format!(" WHERE status IN ({})", placeholders));
        }
        sql.push_str(" ORDER BY created_at, id");

        let mut query = sqlx::query_as::<_, (String, i64, String)>(&sql);
        for status in &filter.statuses {
            query = query.bind(status.as_str());
        }
        let rows = query.fetch_all(&self.pool).await.map_err(db_err)?;

        let mut tasks = Vec::new();
        for (status, version, record) in rows {
            let task = decode_task(&status, version, &record)?;
            if filter.matches(&task) {
                tasks.push(task);
                if filter.limit.is_some_and(|limit| tasks.len() >= limit) {
                    break;
                }
            }
        }
        Ok(tasks)
    }

    async fn delete(&self, id: &TaskId) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let deleted = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        if deleted.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("task: {}", id)));
        }
        sqlx::query("DELETE FROM task_results WHERE task_id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn put_result(&self, result: TaskResult) -> Result<(), StorageError> {
        let record = encode(&result)?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO task_results (task_id, attempt, status, finished_at, format_version, record)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(result.task_id.as_str())
        .bind(i64::from(result.attempt))
        .bind(result.status.as_str())
        .bind(timestamp(result.finished_at))
        .bind(FORMAT_VERSION)
        .bind(record)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(
                StorageError::DuplicateKey(format!("result: {}/{}", result.task_id, result.attempt)),
            ),
            Err(e) => Err(db_err(e)),
        }
    }

    async fn latest_result(&self, id: &TaskId) -> Result<Option<TaskResult>, StorageError> {
        let row: Option<(i64, String)> = sqlx::query_as(
            "SELECT format_version, record FROM task_results WHERE task_id = ? ORDER BY attempt DESC LIMIT 1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|(version, record)| decode_result(version, &record))
            .transpose()
    }

    async fn list_results(&self, id: &TaskId) -> Result<Vec<TaskResult>, StorageError> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT format_version, record FROM task_results WHERE task_id = ? ORDER BY attempt",
        )
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter()
            .map(|(version, record)| decode_result(version, &record))
            .collect()
    }
}
