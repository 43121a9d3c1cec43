//! Worker pool.
//!
//! Workers take assignments from a shared channel, run them, and report back
//! on the completion channel. Each attempt runs in its own tokio task so that
//! a panic in a registered function is reported as a crash instead of taking
//! the worker down.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::core::cancel::CancelToken;
use crate::core::clock::{Clock, deadline_after};
use crate::core::model::{ExecutionKind, Task};
use crate::core::policy::SandboxPolicy;
use crate::core::registry::FunctionRegistry;
use crate::core::result::{FailureKind, TaskResult};
use crate::core::task::{FunctionContext, TaskError};
use crate::core::types::TaskId;
use crate::pipeline::{ExecutionPipeline, ScriptRequest};
use crate::sandbox::{ProcessSandbox, SandboxRequest};

/// One attempt handed to a worker.
pub(crate) struct Assignment {
    pub dispatch_id: u64,
    pub task: Task,
    pub cancel: CancelToken,
}

/// Reports from workers to the dispatcher.
#[derive(Debug)]
pub(crate) enum WorkerMessage {
    Heartbeat {
        dispatch_id: u64,
        task_id: TaskId,
    },
    Finished {
        dispatch_id: u64,
        task_id: TaskId,
        result: TaskResult,
    },
    Crashed {
        dispatch_id: u64,
        task_id: TaskId,
        reason: String,
    },
}

/// Everything a worker needs to run any kind of task.
#[derive(Clone)]
pub(crate) struct Executors {
    pub registry: Arc<FunctionRegistry>,
    pub sandbox: ProcessSandbox,
    pub pipeline: ExecutionPipeline,
    pub default_policy: SandboxPolicy,
    pub clock: Arc<dyn Clock>,
}

/// Start `size` workers sharing `assignments`.
///
/// Workers exit once the assignment sender is dropped.
pub(crate) fn spawn_pool(
    size: usize,
    executors: Executors,
    assignments: mpsc::UnboundedReceiver<Assignment>,
    reports: mpsc::UnboundedSender<WorkerMessage>,
    heartbeat_interval: Duration,
) -> Vec<JoinHandle<()>> {
    let assignments = Arc::new(Mutex::new(assignments));
    (0..size)
        .map(|worker| {
            let assignments = Arc::clone(&assignments);
            let executors = executors.clone();
            let reports = reports.clone();
            tokio::spawn(async move {
                loop {
                    let next = assignments.lock().await.recv().await;
                    let Some(assignment) = next else {
                        break;
                    };
                    run_assignment(&executors, assignment, &reports, heartbeat_interval).await;
                }
                tracing::debug!(worker, "Worker stopped");
            })
        })
        .collect()
}

async fn run_assignment(
    executors: &Executors,
    assignment: Assignment,
    reports: &mpsc::UnboundedSender<WorkerMessage>,
    heartbeat_interval: Duration,
) {
    let Assignment {
        dispatch_id,
        task,
        cancel,
    } = assignment;
    let task_id = task.id.clone();
    tracing::debug!(task_id = %task_id, attempt = task.retry_count, "Running task");

    let mut attempt = tokio::spawn({
        let executors = executors.clone();
        async move { executors.execute(task, cancel).await }
    });
    let mut heartbeat = tokio::time::interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);

    loop {
        tokio::select! {
            joined = &mut attempt => {
                let message = match joined {
                    Ok(result) => WorkerMessage::Finished {
                        dispatch_id,
                        task_id,
                        result,
                    },
                    Err(e) => {
                        let reason = if e.is_panic() {
                            "task panicked".to_string()
                        } else {
                            "task was aborted".to_string()
                        };
                        tracing::error!(task_id = %task_id, reason = %reason, "Worker lost its task");
                        WorkerMessage::Crashed {
                            dispatch_id,
                            task_id,
                            reason,
                        }
                    }
                };
                let _ = reports.send(message);
                break;
            }
            _ = heartbeat.tick() => {
                let _ = reports.send(WorkerMessage::Heartbeat {
                    dispatch_id,
                    task_id: task_id.clone(),
                });
            }
        }
    }
}

impl Executors {
    /// Run one attempt of `task`. Never fails: every outcome is a result.
    pub(crate) async fn execute(&self, task: Task, cancel: CancelToken) -> TaskResult {
        match &task.kind {
            ExecutionKind::Function { function, args } => {
                self.run_function(&task, function, args.clone(), cancel).await
            }
            ExecutionKind::Command {
                argv,
                stdin,
                inputs,
            } => {
                let request = SandboxRequest::new(argv.clone())
                    .with_stdin(stdin.clone())
                    .with_inputs(inputs.clone());
                self.run_command(&task, request, cancel).await
            }
            ExecutionKind::Script {
                language,
                source,
                stdin,
            } => {
                let request = ScriptRequest::new(language.clone(), source.clone())
                    .with_stdin(stdin.clone());
                self.run_script(&task, request, cancel).await
            }
        }
    }

    fn policy_for(&self, task: &Task) -> SandboxPolicy {
        task.policy
            .clone()
            .unwrap_or_else(|| self.default_policy.clone())
    }

    async fn run_function(
        &self,
        task: &Task,
        function: &str,
        args: serde_json::Value,
        cancel: CancelToken,
    ) -> TaskResult {
        let started = self.clock.now();
        let attempt = task.retry_count;
        let Some(callable) = self.registry.get(function) else {
            return TaskResult::failure(
                task.id.clone(),
                attempt,
                FailureKind::InvalidRequest,
                format!("unknown function: {}", function),
                started,
                self.clock.now(),
            );
        };

        let ctx = FunctionContext {
            task_id: task.id.clone(),
            attempt,
            args,
            cancel: cancel.clone(),
        };
        let outcome = tokio::select! {
            outcome = tokio::time::timeout(task.timeout, callable.call(ctx)) => Some(outcome),
            _ = cancel.cancelled() => None,
        };
        let finished = self.clock.now();

        let fail = |failure: FailureKind, error: String| {
            TaskResult::failure(task.id.clone(), attempt, failure, error, started, finished)
        };
        match outcome {
            None | Some(Ok(Err(TaskError::Cancelled))) => {
                fail(FailureKind::Cancelled, "Cancelled: cancelled while running".to_string())
            }
            Some(Ok(Ok(value))) => {
                TaskResult::success(task.id.clone(), attempt, started, finished).with_value(value)
            }
            Some(Ok(Err(e))) if e.is_transient() => fail(FailureKind::TransientError, e.to_string()),
            Some(Ok(Err(e))) => fail(FailureKind::FunctionError, e.to_string()),
            Some(Err(_)) => fail(
                FailureKind::Timeout,
                format!("Timeout: exceeded wall-clock limit of {:?}", task.timeout),
            ),
        }
    }

    async fn run_command(
        &self,
        task: &Task,
        request: SandboxRequest,
        cancel: CancelToken,
    ) -> TaskResult {
        let started = self.clock.now();
        let policy = self.policy_for(task);
        let deadline = deadline_after(Instant::now(), task.timeout);
        let outcome = self
            .sandbox
            .execute(request, &policy, Some(deadline), &cancel)
            .await;
        let finished = self.clock.now();

        match outcome {
            Ok(output) => {
                let result = if output.success() {
                    TaskResult::success(task.id.clone(), task.retry_count, started, finished)
                } else {
                    TaskResult::failure(
                        task.id.clone(),
                        task.retry_count,
                        FailureKind::NonZeroExit,
                        exit_message(output.exit_code, output.signal),
                        started,
                        finished,
                    )
                };
                result.with_output(output.stdout, output.stderr, output.exit_code, output.signal)
            }
            Err(e) => {
                let result = TaskResult::failure(
                    task.id.clone(),
                    task.retry_count,
                    e.failure_kind(),
                    e.to_string(),
                    started,
                    finished,
                );
                match e.output() {
                    Some(output) => result.with_output(
                        output.stdout.clone(),
                        output.stderr.clone(),
                        output.exit_code,
                        output.signal,
                    ),
                    None => result,
                }
            }
        }
    }

    async fn run_script(
        &self,
        task: &Task,
        request: ScriptRequest,
        cancel: CancelToken,
    ) -> TaskResult {
        let started = self.clock.now();
        let policy = self.policy_for(task);
        let deadline = deadline_after(Instant::now(), task.timeout);
        let outcome = self
            .pipeline
            .run(&request, &policy, Some(deadline), &cancel)
            .await;
        let finished = self.clock.now();

        match outcome {
            Ok(outcome) => {
                let result = if outcome.compiled == Some(false) {
                    TaskResult::failure(
                        task.id.clone(),
                        task.retry_count,
                        FailureKind::CompileFailed,
                        format!("CompileFailed: {} compiler rejected the source", outcome.language),
                        started,
                        finished,
                    )
                } else if outcome.success() {
                    TaskResult::success(task.id.clone(), task.retry_count, started, finished)
                } else {
                    TaskResult::failure(
                        task.id.clone(),
                        task.retry_count,
                        FailureKind::NonZeroExit,
                        exit_message(outcome.exit_code, outcome.signal),
                        started,
                        finished,
                    )
                };
                result
                    .with_output(outcome.stdout, outcome.stderr, outcome.exit_code, outcome.signal)
                    .with_diagnostics(outcome.diagnostics)
            }
            Err(e) => {
                let result = TaskResult::failure(
                    task.id.clone(),
                    task.retry_count,
                    e.failure_kind(),
                    e.to_string(),
                    started,
                    finished,
                );
                match e.output() {
                    Some(output) => result.with_output(
                        output.stdout.clone(),
                        output.stderr.clone(),
                        output.exit_code,
                        output.signal,
                    ),
                    None => result,
                }
            }
        }
    }
}

fn exit_message(exit_code: Option<i32>, signal: Option<i32>) -> String {
    match (exit_code, signal) {
        (_, Some(signal)) => format!("NonZeroExit: killed by signal {}", signal),
        (Some(code), None) => format!("NonZeroExit: exited with status {}", code),
        (None, None) => "NonZeroExit: exited abnormally".to_string(),
    }
}
