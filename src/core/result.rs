//! Per-attempt execution results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

use super::model::TaskStatus;
use super::serde_duration;
use super::types::TaskId;

/// Which resource limit a process hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Memory,
    Cpu,
    FileSize,
    Processes,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Memory => "memory",
            ResourceKind::Cpu => "cpu",
            ResourceKind::FileSize => "file size",
            ResourceKind::Processes => "processes",
        };
        f.write_str(name)
    }
}

/// Classified reason an attempt did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "resource", rename_all = "snake_case")]
pub enum FailureKind {
    /// Wall-clock deadline exceeded.
    Timeout,
    /// A sandbox resource limit was exceeded.
    ResourceExceeded(ResourceKind),
    /// Process exited with a non-zero status.
    NonZeroExit,
    /// Compilation failed; see diagnostics.
    CompileFailed,
    /// The process could not be started.
    SpawnFailed,
    /// A registered function returned an error.
    FunctionError,
    /// A registered function returned a transient error.
    TransientError,
    /// The request was rejected before anything ran.
    InvalidRequest,
    /// The language's toolchain is not installed.
    ToolchainUnavailable,
    /// A dependency id does not exist.
    UnknownDependency,
    /// A dependency ended Failed or Cancelled.
    DependencyFailed,
    /// The worker died or stopped heartbeating.
    WorkerCrashed,
    /// Cancelled by the caller.
    Cancelled,
}

impl FailureKind {
    /// Failures that may succeed on another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FailureKind::Timeout
                | FailureKind::SpawnFailed
                | FailureKind::TransientError
                | FailureKind::WorkerCrashed
        )
    }

    /// Failures that retrying cannot fix.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            FailureKind::UnknownDependency
                | FailureKind::DependencyFailed
                | FailureKind::Cancelled
                | FailureKind::ToolchainUnavailable
                | FailureKind::InvalidRequest
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Timeout => f.write_str("Timeout"),
            FailureKind::ResourceExceeded(kind) => write!(f, "ResourceExceeded({})", kind),
            FailureKind::NonZeroExit => f.write_str("NonZeroExit"),
            FailureKind::CompileFailed => f.write_str("CompileFailed"),
            FailureKind::SpawnFailed => f.write_str("SpawnFailed"),
            FailureKind::FunctionError => f.write_str("FunctionError"),
            FailureKind::TransientError => f.write_str("TransientError"),
            FailureKind::InvalidRequest => f.write_str("InvalidRequest"),
            FailureKind::ToolchainUnavailable => f.write_str("ToolchainUnavailable"),
            FailureKind::UnknownDependency => f.write_str("UnknownDependency"),
            FailureKind::DependencyFailed => f.write_str("DependencyFailed"),
            FailureKind::WorkerCrashed => f.write_str("WorkerCrashed"),
            FailureKind::Cancelled => f.write_str("Cancelled"),
        }
    }
}

/// Outcome of one attempt of a task. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    /// Retry count at the time of the attempt (0 for the first run).
    pub attempt: u32,
    /// Completed, Failed, or Cancelled.
    pub status: TaskStatus,
    /// Return value of a function task.
    pub value: Option<Value>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    /// Terminating signal, if the process was killed.
    pub signal: Option<i32>,
    /// Compiler output for scripts in compiled languages.
    pub diagnostics: Option<String>,
    pub failure: Option<FailureKind>,
    /// Human-readable error for non-completed attempts.
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(with = "serde_duration")]
    pub duration: Duration,
}

impl TaskResult {
    /// Successful attempt with no output yet attached.
    pub fn success(
        task_id: TaskId,
        attempt: u32,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            attempt,
            status: TaskStatus::Completed,
            value: None,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            signal: None,
            diagnostics: None,
            failure: None,
            error: None,
            started_at,
            finished_at,
            duration: (finished_at - started_at).to_std().unwrap_or_default(),
        }
    }

    /// Failed (or cancelled) attempt.
    pub fn failure(
        task_id: TaskId,
        attempt: u32,
        failure: FailureKind,
        error: impl Into<String>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        let status = if failure == FailureKind::Cancelled {
            TaskStatus::Cancelled
        } else {
            TaskStatus::Failed
        };
        Self {
            status,
            failure: Some(failure),
            error: Some(error.into()),
            ..Self::success(task_id, attempt, started_at, finished_at)
        }
    }

    /// Attach a function's return value.
    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    /// Attach captured process output.
    pub fn with_output(
        mut self,
        stdout: String,
        stderr: String,
        exit_code: Option<i32>,
        signal: Option<i32>,
    ) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self.exit_code = exit_code;
        self.signal = signal;
        self
    }

    /// Attach compiler diagnostics.
    pub fn with_diagnostics(mut self, diagnostics: Option<String>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Whether the attempt completed.
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}
