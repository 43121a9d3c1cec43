//! Graceful shutdown integration tests.
//!
//! Tests that verify the engine drains running tasks before stopping and
//! rejects new work once shutdown has begun.

use crate::common::wait_for_status;
use async_trait::async_trait;
use corral::{
    Engine, EngineConfig, EngineError, EngineState, Event, EventBus, EventHandler,
    FunctionRegistry, InMemoryStore, TaskSpec, TaskStatus, TaskStore, Toolchains,
};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

const WAIT: Duration = Duration::from_secs(10);

/// Recording event handler for verifying events.
struct RecordingHandler {
    events: Mutex<Vec<Event>>,
}

impl RecordingHandler {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    async fn completed_count(&self) -> usize {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| matches!(e, Event::TaskCompleted { .. }))
            .count()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &Event) {
        self.events.lock().await.push(event.clone());
    }
}

fn config() -> EngineConfig {
    EngineConfig::default()
        .with_pool_size(2)
        .with_tick_interval(Duration::from_millis(20))
}

/// Test: Shutdown waits for a running task to finish.
#[tokio::test]
async fn test_shutdown_waits_for_running_task() {
    let finished = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&finished);
    let registry = FunctionRegistry::new().with_fn("slow", move |_ctx| {
        let flag = Arc::clone(&flag);
        async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(Value::Null)
        }
    });

    let recorder = RecordingHandler::new();
    let event_bus = EventBus::new();
    event_bus.register(recorder.clone()).await;

    let storage = Arc::new(InMemoryStore::new());
    let (handle, engine_task) = Engine::with_storage(Arc::clone(&storage))
        .with_config(config())
        .with_registry(registry)
        .with_event_bus(event_bus)
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

    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(storage.get(&id).await.unwrap().status, TaskStatus::Completed);
    assert_eq!(recorder.completed_count().await, 1);
    assert_eq!(handle.state().await, EngineState::Stopped);

    tokio::time::timeout(WAIT, engine_task)
        .await
        .expect("engine task did not exit")
        .unwrap();
}

/// Test: Shutdown with nothing running stops promptly.
#[tokio::test]
async fn test_shutdown_when_idle() {
    let (handle, engine_task) = Engine::new(InMemoryStore::new())
        .with_config(config())
        .with_toolchains(Toolchains::default())
        .start()
        .await
        .unwrap();

    assert_eq!(handle.state().await, EngineState::Running);
    assert!(handle.is_running().await);

    tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
        .await
        .expect("shutdown took too long")
        .unwrap();

    assert_eq!(handle.state().await, EngineState::Stopped);
    assert!(!handle.is_running().await);
    engine_task.await.unwrap();
}

/// Test: Submissions after shutdown are rejected.
#[tokio::test]
async fn test_submit_after_shutdown_is_rejected() {
    let registry = FunctionRegistry::new().with_fn("noop", |_ctx| async { Ok(Value::Null) });
    let (handle, _engine_task) = Engine::new(InMemoryStore::new())
        .with_config(config())
        .with_registry(registry)
        .with_toolchains(Toolchains::default())
        .start()
        .await
        .unwrap();

    handle.shutdown().await.unwrap();

    let err = handle
        .submit(TaskSpec::function("noop", Value::Null))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ShuttingDown));
}

/// Test: Queued work that never started stays queued for the next start.
#[tokio::test]
async fn test_queued_work_is_kept_on_shutdown() {
    let registry = FunctionRegistry::new().with_fn("slow", |_ctx| async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(Value::Null)
    });
    let storage = Arc::new(InMemoryStore::new());
    let (handle, _engine_task) = Engine::with_storage(Arc::clone(&storage))
        .with_config(config().with_pool_size(1))
        .with_registry(registry)
        .with_toolchains(Toolchains::default())
        .start()
        .await
        .unwrap();

    let first = handle
        .submit(TaskSpec::function("slow", Value::Null))
        .await
        .unwrap();
    let second = handle
        .submit(TaskSpec::function("slow", Value::Null))
        .await
        .unwrap();
    wait_for_status(storage.as_ref(), &first, TaskStatus::Running, WAIT).await;

    handle.shutdown().await.unwrap();

    assert_eq!(
        storage.get(&first).await.unwrap().status,
        TaskStatus::Completed
    );
    assert_eq!(storage.get(&second).await.unwrap().status, TaskStatus::Ready);
}
