//! Complete workflow integration tests.
//!
//! Tests that verify tasks from submission through dispatch to their final
//! result, including priority order and dependency handling.

use crate::common::{roomy_policy, wait_for_status};
use async_trait::async_trait;
use corral::testing::FailingFunction;
use corral::{
    Engine, EngineConfig, Event, EventHandler, FailureKind, FunctionRegistry, InMemoryStore,
    Priority, RetryCondition, RetryPolicy, TaskFilter, TaskId, TaskKind, TaskResult, TaskSpec,
    TaskStatus, Toolchains, YamlLoader, submit_task_file,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const WAIT: Duration = Duration::from_secs(15);

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

    async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }

    async fn started_order(&self) -> Vec<TaskId> {
        self.events
            .lock()
            .await
            .iter()
            .filter_map(|e| match e {
                Event::TaskStarted { task_id, .. } => Some(task_id.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &Event) {
        self.events.lock().await.push(event.clone());
    }
}

fn registry() -> FunctionRegistry {
    FunctionRegistry::new()
        .with_fn("answer", |_ctx| async { Ok(json!(42)) })
        .with_fn("sleep", |ctx: corral::FunctionContext| async move {
            let ms = ctx.args.as_u64().unwrap_or(100);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(Value::Null)
        })
}

fn engine(storage: Arc<InMemoryStore>, pool_size: usize) -> Engine<InMemoryStore> {
    let config = EngineConfig::default()
        .with_pool_size(pool_size)
        .with_tick_interval(Duration::from_millis(20))
        .with_default_policy(roomy_policy());
    Engine::with_storage(storage)
        .with_config(config)
        .with_registry(registry())
        .with_toolchains(Toolchains::discover())
}

async fn wait(handle: &corral::EngineHandle, id: &TaskId) -> TaskResult {
    tokio::time::timeout(WAIT, handle.wait(id.clone()))
        .await
        .expect("task did not finish in time")
        .unwrap()
}

/// Test: A function task returns its value.
#[tokio::test]
async fn test_function_returns_value() {
    let storage = Arc::new(InMemoryStore::new());
    let (handle, _task) = engine(Arc::clone(&storage), 2).start().await.unwrap();

    let id = handle
        .submit(TaskSpec::function("answer", Value::Null).with_name("meaning"))
        .await
        .unwrap();
    let result = wait(&handle, &id).await;

    assert_eq!(result.status, TaskStatus::Completed);
    assert_eq!(result.value, Some(json!(42)));
    assert_eq!(
        handle.result(id.clone()).await.unwrap().unwrap().value,
        Some(json!(42))
    );
    let task = wait_for_status(storage.as_ref(), &id, TaskStatus::Completed, WAIT).await;
    assert!(task.started_at.is_some());
    assert!(task.completed_at.is_some());

    handle.shutdown().await.unwrap();
}

/// Test: A dependency on an unknown id fails at once and never runs.
#[tokio::test]
async fn test_unknown_dependency_never_runs() {
    let storage = Arc::new(InMemoryStore::new());
    let recorder = RecordingHandler::new();
    let engine = engine(Arc::clone(&storage), 2);
    engine.event_bus().register(recorder.clone()).await;
    let (handle, _task) = engine.start().await.unwrap();

    let id = handle
        .submit(TaskSpec::function("answer", Value::Null).depends_on("ghost"))
        .await
        .unwrap();

    assert_eq!(handle.status(id.clone()).await.unwrap(), TaskStatus::Failed);
    let result = handle.result(id.clone()).await.unwrap().unwrap();
    assert_eq!(result.failure, Some(FailureKind::UnknownDependency));
    assert!(result.error.unwrap().starts_with("UnknownDependency"));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!recorder.started_order().await.contains(&id));

    handle.shutdown().await.unwrap();
}

/// Test: A critical task jumps ahead of queued low-priority tasks.
#[tokio::test]
async fn test_critical_dispatches_before_queued_low() {
    let storage = Arc::new(InMemoryStore::new());
    let recorder = RecordingHandler::new();
    let engine = engine(Arc::clone(&storage), 1);
    engine.event_bus().register(recorder.clone()).await;
    let (handle, _task) = engine.start().await.unwrap();

    let blocker = handle
        .submit(TaskSpec::function("sleep", json!(300)))
        .await
        .unwrap();
    wait_for_status(storage.as_ref(), &blocker, TaskStatus::Running, WAIT).await;

    let mut low = Vec::new();
    for i in 0..10 {
        let spec = TaskSpec::function("answer", Value::Null)
            .with_name(format!("low-{}", i))
            .with_priority(Priority::Low);
        low.push(handle.submit(spec).await.unwrap());
    }
    let critical = handle
        .submit(TaskSpec::function("answer", Value::Null).with_priority(Priority::Critical))
        .await
        .unwrap();

    for id in &low {
        wait(&handle, id).await;
    }

    let started = recorder.started_order().await;
    assert_eq!(started[0], blocker);
    assert_eq!(started[1], critical);
    // Equal priority dispatches in submission order.
    assert_eq!(&started[2..], &low[..]);

    handle.shutdown().await.unwrap();
}

/// Test: A dependent starts only after its dependency completed.
#[tokio::test]
async fn test_dependency_chain_runs_in_order() {
    let storage = Arc::new(InMemoryStore::new());
    let recorder = RecordingHandler::new();
    let engine = engine(Arc::clone(&storage), 4);
    engine.event_bus().register(recorder.clone()).await;
    let (handle, _task) = engine.start().await.unwrap();

    let build = handle
        .submit(TaskSpec::command(["sleep", "0.2"]))
        .await
        .unwrap();
    let test = handle
        .submit(TaskSpec::command(["echo", "tested"]).depends_on(build.clone()))
        .await
        .unwrap();
    let report = handle
        .submit(
            TaskSpec::function("answer", Value::Null)
                .depends_on(build.clone())
                .depends_on(test.clone()),
        )
        .await
        .unwrap();

    assert_eq!(handle.status(report.clone()).await.unwrap(), TaskStatus::Pending);
    assert!(wait(&handle, &report).await.is_success());
    assert_eq!(wait(&handle, &test).await.stdout, "tested\n");

    let events = recorder.events().await;
    let position = |pred: &dyn Fn(&Event) -> bool| events.iter().position(pred).unwrap();
    let build_done =
        position(&|e| matches!(e, Event::TaskCompleted { task_id, .. } if *task_id == build));
    let test_start =
        position(&|e| matches!(e, Event::TaskStarted { task_id, .. } if *task_id == test));
    let test_done =
        position(&|e| matches!(e, Event::TaskCompleted { task_id, .. } if *task_id == test));
    let report_start =
        position(&|e| matches!(e, Event::TaskStarted { task_id, .. } if *task_id == report));
    assert!(build_done < test_start);
    assert!(test_done < report_start);

    handle.shutdown().await.unwrap();
}

/// Test: A failing command fails its dependents without running them.
#[tokio::test]
async fn test_failed_command_cascades() {
    let storage = Arc::new(InMemoryStore::new());
    let (handle, _task) = engine(Arc::clone(&storage), 2).start().await.unwrap();

    let root = handle
        .submit(TaskSpec::command(["sh", "-c", "echo oops >&2; exit 4"]))
        .await
        .unwrap();
    let child = handle
        .submit(TaskSpec::function("answer", Value::Null).depends_on(root.clone()))
        .await
        .unwrap();

    let root_result = wait(&handle, &root).await;
    assert_eq!(root_result.failure, Some(FailureKind::NonZeroExit));
    assert_eq!(root_result.exit_code, Some(4));
    assert_eq!(root_result.stderr, "oops\n");

    let child_result = wait(&handle, &child).await;
    assert_eq!(child_result.failure, Some(FailureKind::DependencyFailed));
    assert!(child_result.started_at <= child_result.finished_at);

    handle.shutdown().await.unwrap();
}

/// Test: Cancelling a completed task returns false and keeps its result.
#[tokio::test]
async fn test_cancel_completed_is_noop() {
    let storage = Arc::new(InMemoryStore::new());
    let (handle, _task) = engine(Arc::clone(&storage), 2).start().await.unwrap();

    let id = handle
        .submit(TaskSpec::function("answer", Value::Null))
        .await
        .unwrap();
    let before = wait(&handle, &id).await;

    assert!(!handle.cancel(id.clone()).await.unwrap());
    assert_eq!(handle.status(id.clone()).await.unwrap(), TaskStatus::Completed);
    assert_eq!(handle.result(id).await.unwrap().unwrap(), before);

    handle.shutdown().await.unwrap();
}

/// Test: Cancelling a running command stops it.
#[tokio::test]
async fn test_cancel_running_command() {
    let storage = Arc::new(InMemoryStore::new());
    let (handle, _task) = engine(Arc::clone(&storage), 2).start().await.unwrap();

    let id = handle
        .submit(TaskSpec::command(["sleep", "30"]))
        .await
        .unwrap();
    wait_for_status(storage.as_ref(), &id, TaskStatus::Running, WAIT).await;

    let start = std::time::Instant::now();
    assert!(handle.cancel(id.clone()).await.unwrap());
    let result = wait(&handle, &id).await;

    assert_eq!(result.status, TaskStatus::Cancelled);
    assert!(start.elapsed() < Duration::from_secs(10));

    handle.shutdown().await.unwrap();
}

/// Test: Transient-only retries skip permanent failures.
#[tokio::test]
async fn test_transient_only_retry_condition() {
    let storage = Arc::new(InMemoryStore::new());
    let registry = registry()
        .with_fn("permanent", |_ctx| async {
            Err(corral::TaskError::ExecutionFailed("bad input".to_string()))
        });
    let mut registry = registry;
    registry.register("flaky", Arc::new(FailingFunction::new(2).transient()));
    let (handle, _task) = engine(Arc::clone(&storage), 2)
        .with_registry(registry)
        .start()
        .await
        .unwrap();

    let policy = RetryPolicy::fixed(3, Duration::from_millis(10))
        .with_condition(RetryCondition::TransientOnly);
    let permanent = handle
        .submit(TaskSpec::function("permanent", Value::Null).with_retry(policy.clone()))
        .await
        .unwrap();
    let flaky = handle
        .submit(TaskSpec::function("flaky", Value::Null).with_retry(policy))
        .await
        .unwrap();

    let permanent_result = wait(&handle, &permanent).await;
    assert_eq!(permanent_result.attempt, 0);
    assert_eq!(permanent_result.failure, Some(FailureKind::FunctionError));

    let flaky_result = wait(&handle, &flaky).await;
    assert!(flaky_result.is_success());
    assert_eq!(flaky_result.attempt, 2);
    assert_eq!(flaky_result.value, Some(json!({ "attempt": 2 })));

    handle.shutdown().await.unwrap();
}

/// Test: A task file runs with keys resolved to dependencies.
#[tokio::test]
async fn test_task_file_batch() {
    let yaml = r#"
tasks:
  - key: greet
    kind:
      type: command
      argv: [echo, hello]
    tags: [batch]
  - key: shout
    depends_on: [greet]
    kind:
      type: command
      argv: [tr, a-z, A-Z]
      stdin: hello
    tags: [batch]
  - key: answer
    depends_on: [shout]
    priority: high
    kind:
      type: function
      function: answer
"#;
    let file = YamlLoader::parse_task_file(yaml).unwrap();
    let storage = Arc::new(InMemoryStore::new());
    let (handle, _task) = engine(Arc::clone(&storage), 2).start().await.unwrap();

    let submitted = submit_task_file(&handle, &file).await.unwrap();
    assert_eq!(submitted.len(), 3);
    let id_of = |key: &str| {
        submitted
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, id)| id.clone())
            .unwrap()
    };

    assert_eq!(wait(&handle, &id_of("shout")).await.stdout, "HELLO");
    assert_eq!(wait(&handle, &id_of("answer")).await.value, Some(json!(42)));

    let batch = handle.list(TaskFilter::all().with_tag("batch")).await.unwrap();
    assert_eq!(batch.len(), 2);
    let commands = handle
        .list(TaskFilter::all().with_kind(TaskKind::Command))
        .await
        .unwrap();
    assert_eq!(commands.len(), 2);
    let named = handle.list(TaskFilter::all().with_name("SHO")).await.unwrap();
    assert_eq!(named.len(), 1);
    assert_eq!(named[0].id, id_of("shout"));

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.total_tasks, 3);
    assert_eq!(stats.by_status.get("completed"), Some(&3));
    assert_eq!(stats.by_kind.get("command"), Some(&2));
    assert_eq!(stats.by_priority.get("high"), Some(&1));

    handle.shutdown().await.unwrap();
}
