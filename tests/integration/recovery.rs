//! Recovery scenario integration tests.
//!
//! Tests that verify the engine picks up interrupted work from its store on
//! start and that finished work survives a restart.

use crate::common::wait_for_status;
use async_trait::async_trait;
use chrono::Utc;
use corral::{
    Engine, EngineConfig, EngineHandle, Event, EventBus, EventHandler, FunctionRegistry,
    InMemoryStore, SqliteStore, StoreDump, Task, TaskId, TaskResult, TaskSpec, TaskStatus,
    TaskStore, Toolchains,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Mutex;

const WAIT: Duration = Duration::from_secs(15);

/// Records the ids of recovered tasks.
struct RecoveryRecorder {
    recovered: Mutex<Vec<TaskId>>,
}

impl RecoveryRecorder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            recovered: Mutex::new(Vec::new()),
        })
    }

    async fn recovered(&self) -> Vec<TaskId> {
        self.recovered.lock().await.clone()
    }
}

#[async_trait]
impl EventHandler for RecoveryRecorder {
    async fn handle(&self, event: &Event) {
        if let Event::TaskRecovered { task_id, .. } = event {
            self.recovered.lock().await.push(task_id.clone());
        }
    }
}

fn quick_registry() -> FunctionRegistry {
    FunctionRegistry::new()
        .with_fn("answer", |_ctx| async { Ok(json!(42)) })
        .with_fn("slow", |_ctx| async { Ok(json!("done")) })
}

fn config() -> EngineConfig {
    EngineConfig::default()
        .with_pool_size(2)
        .with_tick_interval(Duration::from_millis(20))
}

async fn wait(handle: &EngineHandle, id: &TaskId) -> TaskResult {
    tokio::time::timeout(WAIT, handle.wait(id.clone()))
        .await
        .expect("task did not finish in time")
        .unwrap()
}

fn stored(id: &str, spec: TaskSpec, status: TaskStatus) -> Task {
    let mut task = Task::from_spec(TaskId::new(id), spec, Utc::now(), Duration::from_secs(5));
    task.status = status;
    task
}

/// Test: Results written by one engine are visible after reopening the database.
#[tokio::test]
async fn test_results_survive_restart() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("corral.db");

    let id = {
        let storage = Arc::new(SqliteStore::new(&db_path).await.unwrap());
        let (handle, _task) = Engine::with_storage(Arc::clone(&storage))
            .with_config(config())
            .with_registry(quick_registry())
            .with_toolchains(Toolchains::default())
            .start()
            .await
            .unwrap();

        let id = handle
            .submit(TaskSpec::function("answer", Value::Null).with_name("persisted"))
            .await
            .unwrap();
        let result = wait(&handle, &id).await;
        assert!(result.is_success());

        handle.shutdown().await.unwrap();
        storage.close().await;
        id
    };

    let storage = Arc::new(SqliteStore::new(&db_path).await.unwrap());
    let (handle, _task) = Engine::with_storage(Arc::clone(&storage))
        .with_config(config())
        .with_registry(quick_registry())
        .with_toolchains(Toolchains::default())
        .start()
        .await
        .unwrap();

    assert_eq!(handle.status(id.clone()).await.unwrap(), TaskStatus::Completed);
    let result = handle.result(id.clone()).await.unwrap().unwrap();
    assert_eq!(result.value, Some(json!(42)));

    // A finished task resolves a new waiter immediately.
    let again = wait(&handle, &id).await;
    assert_eq!(again, result);

    handle.shutdown().await.unwrap();
    storage.close().await;
}

/// Test: A task left Running by a crashed process is replayed on start.
#[tokio::test]
async fn test_interrupted_task_is_replayed() {
    let storage = Arc::new(InMemoryStore::new());
    storage
        .put(stored(
            "interrupted",
            TaskSpec::function("answer", Value::Null),
            TaskStatus::Running,
        ))
        .await
        .unwrap();

    let recorder = RecoveryRecorder::new();
    let event_bus = EventBus::new();
    event_bus.register(recorder.clone()).await;

    let (handle, _task) = Engine::with_storage(Arc::clone(&storage))
        .with_config(config())
        .with_registry(quick_registry())
        .with_event_bus(event_bus)
        .with_toolchains(Toolchains::default())
        .start()
        .await
        .unwrap();

    let id = TaskId::new("interrupted");
    wait_for_status(storage.as_ref(), &id, TaskStatus::Completed, WAIT).await;
    assert_eq!(recorder.recovered().await, vec![id.clone()]);

    let result = handle.result(id).await.unwrap().unwrap();
    assert_eq!(result.value, Some(json!(42)));

    handle.shutdown().await.unwrap();
}

/// Test: Queued work in the store is picked up on start, dependencies included.
#[tokio::test]
async fn test_queued_work_resumes_on_start() {
    let storage = Arc::new(InMemoryStore::new());
    storage
        .put(stored(
            "upstream",
            TaskSpec::function("answer", Value::Null),
            TaskStatus::Completed,
        ))
        .await
        .unwrap();
    storage
        .put(stored(
            "downstream",
            TaskSpec::function("answer", Value::Null).depends_on("upstream"),
            TaskStatus::Pending,
        ))
        .await
        .unwrap();
    storage
        .put(stored(
            "ready",
            TaskSpec::function("answer", Value::Null),
            TaskStatus::Ready,
        ))
        .await
        .unwrap();

    let (handle, _task) = Engine::with_storage(Arc::clone(&storage))
        .with_config(config())
        .with_registry(quick_registry())
        .with_toolchains(Toolchains::default())
        .start()
        .await
        .unwrap();

    wait_for_status(
        storage.as_ref(),
        &TaskId::new("downstream"),
        TaskStatus::Completed,
        WAIT,
    )
    .await;
    wait_for_status(
        storage.as_ref(),
        &TaskId::new("ready"),
        TaskStatus::Completed,
        WAIT,
    )
    .await;

    handle.shutdown().await.unwrap();
}

/// Test: Work abandoned by a shutdown timeout runs again on the next start.
#[tokio::test]
async fn test_shutdown_timeout_work_replays() {
    let storage = Arc::new(InMemoryStore::new());

    let stuck = FunctionRegistry::new().with_fn("slow", |_ctx| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Value::Null)
    });
    let (handle, _task) = Engine::with_storage(Arc::clone(&storage))
        .with_config(config().with_shutdown_timeout(Duration::from_millis(100)))
        .with_registry(stuck)
        .with_toolchains(Toolchains::default())
        .start()
        .await
        .unwrap();

    let id = handle
        .submit(TaskSpec::function("slow", Value::Null))
        .await
        .unwrap();
    wait_for_status(storage.as_ref(), &id, TaskStatus::Running, WAIT).await;
    handle.shutdown().await.unwrap();

    assert_eq!(storage.get(&id).await.unwrap().status, TaskStatus::Running);

    let (handle, _task) = Engine::with_storage(Arc::clone(&storage))
        .with_config(config())
        .with_registry(quick_registry())
        .with_toolchains(Toolchains::default())
        .start()
        .await
        .unwrap();

    let result = wait(&handle, &id).await;
    assert!(result.is_success());
    assert_eq!(result.value, Some(json!("done")));

    handle.shutdown().await.unwrap();
}

/// Test: An export from one store imported into SQLite carries results and pending work.
#[tokio::test]
async fn test_export_moves_work_between_stores() {
    let source = Arc::new(InMemoryStore::new());
    let (handle, _task) = Engine::with_storage(Arc::clone(&source))
        .with_config(config())
        .with_registry(quick_registry())
        .with_toolchains(Toolchains::default())
        .start()
        .await
        .unwrap();
    let finished = handle
        .submit(TaskSpec::function("answer", Value::Null))
        .await
        .unwrap();
    assert!(wait(&handle, &finished).await.is_success());
    handle.shutdown().await.unwrap();

    source
        .put(stored(
            "left-behind",
            TaskSpec::function("slow", Value::Null),
            TaskStatus::Ready,
        ))
        .await
        .unwrap();

    let json = StoreDump::export(source.as_ref(), Utc::now())
        .await
        .unwrap()
        .to_json()
        .unwrap();

    let temp_dir = TempDir::new().unwrap();
    let target = Arc::new(SqliteStore::new(temp_dir.path().join("moved.db")).await.unwrap());
    let summary = StoreDump::from_json(&json)
        .unwrap()
        .import_into(target.as_ref())
        .await
        .unwrap();
    assert_eq!(summary.tasks, 2);
    assert_eq!(summary.results, 1);

    let (handle, _task) = Engine::with_storage(Arc::clone(&target))
        .with_config(config())
        .with_registry(quick_registry())
        .with_toolchains(Toolchains::default())
        .start()
        .await
        .unwrap();

    let result = handle.result(finished.clone()).await.unwrap().unwrap();
    assert_eq!(result.value, Some(json!(42)));

    let moved = wait(&handle, &TaskId::new("left-behind")).await;
    assert_eq!(moved.value, Some(json!("done")));

    handle.shutdown().await.unwrap();
    target.close().await;
}
