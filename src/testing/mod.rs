//! Testing utilities for users of the Corral library.
//!
//! This module provides helpers for testing task functions and workloads:
//!
//! - [`FailingFunction`]: A function that fails N times then succeeds
//! - [`TestHarness`]: Runs tasks on an engine with in-memory storage

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::core::model::TaskSpec;
use crate::core::registry::FunctionRegistry;
use crate::core::result::TaskResult;
use crate::core::task::{FunctionContext, TaskError, TaskFunction};
use crate::pipeline::Toolchains;
use crate::scheduler::{Engine, EngineError};
use crate::storage::InMemoryStore;

/// A function that fails a fixed number of times before succeeding.
///
/// # Example
///
/// ```
/// use corral::testing::FailingFunction;
///
/// // Fails 2 times, then succeeds on the 3rd attempt
/// let function = FailingFunction::new(2);
/// ```
pub struct FailingFunction {
    /// Mutex protecting failure state to prevent race conditions under concurrent execution.
    state: Mutex<FailingFunctionState>,
    total_failures: u32,
    error_message: String,
    transient: bool,
}

/// Internal state for FailingFunction, protected by a mutex.
struct FailingFunctionState {
    failures_remaining: u32,
    call_count: u32,
}

impl FailingFunction {
    /// Create a function that fails `fail_count` times then succeeds.
    pub fn new(fail_count: u32) -> Self {
        Self::with_error(fail_count, "intentional test failure")
    }

    /// Create a function that fails with a custom error message.
    pub fn with_error(fail_count: u32, message: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(FailingFunctionState {
                failures_remaining: fail_count,
                call_count: 0,
            }),
            total_failures: fail_count,
            error_message: message.into(),
            transient: false,
        }
    }

    /// Report failures as transient instead of permanent.
    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    /// Get the number of failures remaining before success.
    pub async fn failures_remaining(&self) -> u32 {
        self.state.lock().await.failures_remaining
    }

    /// Get the number of times this function has been called.
    pub async fn call_count(&self) -> u32 {
        self.state.lock().await.call_count
    }

    /// Reset the failure counter for reuse.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.failures_remaining = self.total_failures;
        state.call_count = 0;
    }
}

#[async_trait]
impl TaskFunction for FailingFunction {
    async fn call(&self, ctx: FunctionContext) -> Result<Value, TaskError> {
        let mut state = self.state.lock().await;
        state.call_count += 1;

        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            let message = self.error_message.clone();
            if self.transient {
                Err(TaskError::Transient(message))
            } else {
                Err(TaskError::ExecutionFailed(message))
            }
        } else {
            Ok(json!({ "attempt": ctx.attempt }))
        }
    }
}

/// A test harness for running tasks on a short-lived engine.
///
/// Each run starts an engine over in-memory storage with a fast tick,
/// submits the specs, waits for all of them, and shuts the engine down.
/// Scripts are rejected unless toolchains are supplied.
///
/// # Example
///
/// ```ignore
/// use corral::testing::TestHarness;
/// use corral::{FunctionRegistry, TaskSpec};
/// use serde_json::json;
///
/// let registry = FunctionRegistry::new().with_fn("double", |ctx| async move {
///     Ok(json!(ctx.args.as_i64().unwrap_or(0) * 2))
/// });
/// let harness = TestHarness::new().with_registry(registry);
///
/// let results = harness.run(vec![TaskSpec::function("double", json!(21))]).await?;
/// assert_eq!(results[0].value, Some(serde_json::json!(42)));
/// ```
pub struct TestHarness {
    registry: FunctionRegistry,
    pool_size: usize,
    toolchains: Toolchains,
    timeout: Duration,
}

impl TestHarness {
    /// Create a new test harness.
    pub fn new() -> Self {
        Self {
            registry: FunctionRegistry::new(),
            pool_size: 4,
            toolchains: Toolchains::default(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Register a function under `name`.
    pub fn with_function(
        mut self,
        name: impl Into<String>,
        function: impl TaskFunction + 'static,
    ) -> Self {
        self.registry.register(name, Arc::new(function));
        self
    }

    /// Replace the function registry.
    pub fn with_registry(mut self, registry: FunctionRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Set the number of workers.
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Use these toolchains for scripts.
    pub fn with_toolchains(mut self, toolchains: Toolchains) -> Self {
        self.toolchains = toolchains;
        self
    }

    /// Limit how long a run may take overall.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run the specs and return their final results in submission order.
    pub async fn run(&self, specs: Vec<TaskSpec>) -> Result<Vec<TaskResult>, EngineError> {
        let (handle, engine_task) = Engine::new(InMemoryStore::new())
            .with_registry(self.registry.clone())
            .with_toolchains(self.toolchains.clone())
            .with_pool_size(self.pool_size)
            .with_tick_interval(Duration::from_millis(10))
            .start()
            .await?;

        let mut ids = Vec::with_capacity(specs.len());
        for spec in specs {
            ids.push(handle.submit(spec).await?);
        }

        let waited = tokio::time::timeout(self.timeout, async {
            let mut results = Vec::with_capacity(ids.len());
            for id in &ids {
                results.push(handle.wait(id.clone()).await?);
            }
            Ok::<_, EngineError>(results)
        })
        .await;

        handle.shutdown().await?;
        let _ = engine_task.await;

        match waited {
            Ok(results) => results,
            Err(_) => Err(EngineError::ChannelError(format!(
                "tasks did not finish within {:?}",
                self.timeout
            ))),
        }
    }

    /// Run one spec and return its result.
    pub async fn run_one(&self, spec: TaskSpec) -> Result<TaskResult, EngineError> {
        let mut results = self.run(vec![spec]).await?;
        results
            .pop()
            .ok_or_else(|| EngineError::ChannelError("no result".to_string()))
    }

    /// Run and assert every task succeeded.
    pub async fn run_and_assert_success(&self, specs: Vec<TaskSpec>) -> Vec<TaskResult> {
        let results = self.run(specs).await.expect("harness run failed");
        let failed: Vec<_> = results
            .iter()
            .filter(|r| !r.is_success())
            .map(|r| (r.task_id.clone(), r.error.clone()))
            .collect();
        assert!(
            failed.is_empty(),
            "Expected all tasks to succeed, but some failed: {:?}",
            failed
        );
        results
    }

    /// Run and assert at least one task did not succeed.
    pub async fn run_and_assert_failure(&self, specs: Vec<TaskSpec>) -> Vec<TaskResult> {
        let results = self.run(specs).await.expect("harness run failed");
        assert!(
            results.iter().any(|r| !r.is_success()),
            "Expected a task to fail, but all succeeded"
        );
        results
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cancel::CancelToken;
    use crate::core::policy::SandboxPolicy;
    use crate::core::result::FailureKind;
    use crate::core::retry::RetryPolicy;
    use crate::core::types::TaskId;

    fn ctx(attempt: u32) -> FunctionContext {
        FunctionContext {
            task_id: TaskId::new("t"),
            attempt,
            args: Value::Null,
            cancel: CancelToken::never(),
        }
    }

    #[tokio::test]
    async fn test_failing_function_counts_down() {
        let function = FailingFunction::new(2);

        assert!(function.call(ctx(0)).await.is_err());
        assert!(function.call(ctx(1)).await.is_err());
        assert_eq!(function.failures_remaining().await, 0);
        assert_eq!(function.call(ctx(2)).await.unwrap(), json!({ "attempt": 2 }));
        assert_eq!(function.call_count().await, 3);

        function.reset().await;
        assert_eq!(function.failures_remaining().await, 2);
        assert_eq!(function.call_count().await, 0);
    }

    #[tokio::test]
    async fn test_transient_failures_are_marked() {
        let function = FailingFunction::with_error(1, "flaky").transient();
        let err = function.call(ctx(0)).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_harness_runs_with_retry() {
        let harness = TestHarness::new().with_function("flaky", FailingFunction::new(2));
        let spec = TaskSpec::function("flaky", Value::Null)
            .with_retry(RetryPolicy::fixed(2, Duration::ZERO));

        let result = harness.run_one(spec).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.attempt, 2);
    }

    #[tokio::test]
    async fn test_harness_reports_failure() {
        let harness = TestHarness::new().with_function("broken", FailingFunction::new(5));

        let results = harness
            .run_and_assert_failure(vec![TaskSpec::function("broken", Value::Null)])
            .await;
        assert_eq!(results[0].failure, Some(FailureKind::FunctionError));
        assert_eq!(
            results[0].error.as_deref(),
            Some("execution failed: intentional test failure")
        );
    }

    #[tokio::test]
    async fn test_harness_runs_commands() {
        let results = TestHarness::new()
            .run_and_assert_success(vec![
                TaskSpec::command(["echo", "hello"])
                    .with_policy(SandboxPolicy::default().with_max_processes(1024)),
            ])
            .await;
        assert_eq!(results[0].stdout.trim(), "hello");
    }
}
