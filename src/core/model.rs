//! Task data model: specs submitted by callers and the records the engine keeps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use super::policy::SandboxPolicy;
use super::retry::RetryPolicy;
use super::schedule::Recurrence;
use super::serde_duration;
use super::types::TaskId;

/// Lifecycle state of a task.
///
/// `Scheduled -> Pending -> Ready -> Running -> {Completed, Failed, Cancelled}`,
/// with `Failed -> Scheduled/Pending` for retries, `Running -> Pending` for
/// crash replay, and `Pending/Ready <-> Paused`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for its scheduled time.
    Scheduled,
    /// Admitted, waiting on dependencies.
    Pending,
    /// Dependencies satisfied, queued for a worker.
    Ready,
    /// Claimed by a worker.
    Running,
    /// Held back from dispatch by the caller.
    Paused,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully (may still be retried).
    Failed,
    /// Cancelled by the caller.
    Cancelled,
}

impl TaskStatus {
    /// All states, in lifecycle order.
    pub const ALL: [TaskStatus; 8] = [
        TaskStatus::Scheduled,
        TaskStatus::Pending,
        TaskStatus::Ready,
        TaskStatus::Running,
        TaskStatus::Paused,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    /// Stable lowercase name, used for persistence.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Completed, Failed, or Cancelled.
    ///
    /// A Failed task with retry budget left is moved out of Failed by the
    /// dispatcher in the same step that records the failure.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Not yet dispatched and still eligible to run.
    pub fn is_queued(&self) -> bool {
        matches!(
            self,
            TaskStatus::Scheduled | TaskStatus::Pending | TaskStatus::Ready | TaskStatus::Paused
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown task status: {}", s))
    }
}

/// Dispatch priority. Higher priorities always dispatch first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// All priorities, lowest first.
    pub const ALL: [Priority; 4] = [
        Priority::Low,
        Priority::Normal,
        Priority::High,
        Priority::Critical,
    ];

    /// Numeric level (Low = 1 .. Critical = 4).
    pub fn level(&self) -> i64 {
        match self {
            Priority::Low => 1,
            Priority::Normal => 2,
            Priority::High => 3,
            Priority::Critical => 4,
        }
    }

    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Priority::ALL
            .into_iter()
            .find(|priority| priority.as_str() == s.to_ascii_lowercase())
            .ok_or_else(|| format!("unknown priority: {}", s))
    }
}

/// Coarse execution category, for filtering and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Function,
    Command,
    Script,
}

impl TaskKind {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Function => "function",
            TaskKind::Command => "command",
            TaskKind::Script => "script",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a task runs. Carries the task's payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionKind {
    /// A callable from the function registry.
    Function {
        function: String,
        #[serde(default)]
        args: Value,
    },
    /// An external program run inside the process sandbox.
    Command {
        argv: Vec<String>,
        #[serde(default)]
        stdin: Option<String>,
        /// Host files copied into the workspace before the run.
        #[serde(default)]
        inputs: Vec<PathBuf>,
    },
    /// Source code run through the execution pipeline.
    Script {
        language: String,
        source: String,
        #[serde(default)]
        stdin: Option<String>,
    },
}

impl ExecutionKind {
    /// Coarse category.
    pub fn kind(&self) -> TaskKind {
        match self {
            ExecutionKind::Function { .. } => TaskKind::Function,
            ExecutionKind::Command { .. } => TaskKind::Command,
            ExecutionKind::Script { .. } => TaskKind::Script,
        }
    }

    /// Name used when the spec does not provide one.
    fn default_name(&self) -> String {
        match self {
            ExecutionKind::Function { function, .. } => function.clone(),
            ExecutionKind::Command { argv, .. } => argv.first().cloned().unwrap_or_default(),
            ExecutionKind::Script { language, .. } => format!("{} script", language),
        }
    }
}

/// Reasons a spec is rejected at submission.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Command with an empty argv.
    #[error("command task has an empty argv")]
    EmptyCommand,

    /// Script without source text.
    #[error("script task has no source")]
    EmptySource,

    /// Function or language name missing.
    #[error("missing {0}")]
    MissingField(&'static str),

    /// Timeout of zero.
    #[error("timeout must be greater than zero")]
    ZeroTimeout,

    /// Policy that can never run anything.
    #[error("invalid sandbox policy: {0}")]
    InvalidPolicy(String),

    /// Function not present in the registry.
    #[error("unknown function: {0}")]
    UnknownFunction(String),

    /// Script language not in the language table.
    #[error("unknown language: {0}")]
    UnknownLanguage(String),

    /// Script language not installed on this host.
    #[error("ToolchainUnavailable: no toolchain for language {0}")]
    ToolchainUnavailable(String),
}

/// A task as submitted by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Display name. Defaults to the function, program, or language.
    #[serde(default)]
    pub name: String,
    /// Optional free-form description.
    #[serde(default)]
    pub description: Option<String>,
    /// What to run.
    pub kind: ExecutionKind,
    /// Dispatch priority.
    #[serde(default)]
    pub priority: Priority,
    /// Tasks that must complete before this one runs.
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    /// Retry behaviour on failure.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Per-attempt timeout. Defaults to the engine's default timeout.
    #[serde(default, with = "serde_duration::option")]
    pub timeout: Option<Duration>,
    /// Do not run before this time.
    #[serde(default)]
    pub scheduled_time: Option<DateTime<Utc>>,
    /// Run again on this pattern after each finished run.
    #[serde(default)]
    pub recurrence: Option<Recurrence>,
    /// Sandbox limits. Defaults to the engine's default policy.
    #[serde(default)]
    pub policy: Option<SandboxPolicy>,
    /// Labels for filtering.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Arbitrary caller metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl TaskSpec {
    /// Create a spec with defaults for everything except `kind`.
    pub fn new(kind: ExecutionKind) -> Self {
        Self {
            name: String::new(),
            description: None,
            kind,
            priority: Priority::Normal,
            dependencies: Vec::new(),
            retry: RetryPolicy::default(),
            timeout: None,
            scheduled_time: None,
            recurrence: None,
            policy: None,
            tags: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Spec for a registered function.
    pub fn function(function: impl Into<String>, args: Value) -> Self {
        Self::new(ExecutionKind::Function {
            function: function.into(),
            args,
        })
    }

    /// Spec for a sandboxed command.
    pub fn command<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(ExecutionKind::Command {
            argv: argv.into_iter().map(Into::into).collect(),
            stdin: None,
            inputs: Vec::new(),
        })
    }

    /// Spec for source code run through the pipeline.
    pub fn script(language: impl Into<String>, source: impl Into<String>) -> Self {
        Self::new(ExecutionKind::Script {
            language: language.into(),
            source: source.into(),
            stdin: None,
        })
    }

    /// Builder: set the name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Builder: set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Builder: set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Builder: add a dependency.
    pub fn depends_on(mut self, id: impl Into<TaskId>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    /// Builder: set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Builder: set the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Builder: delay the first run until `at`.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_time = Some(at);
        self
    }

    /// Builder: repeat the task on `recurrence`.
    ///
    /// Without an explicit scheduled time the first run happens one interval
    /// after submission.
    pub fn with_recurrence(mut self, recurrence: Recurrence) -> Self {
        self.recurrence = Some(recurrence);
        self
    }

    /// Builder: set the sandbox policy.
    pub fn with_policy(mut self, policy: SandboxPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Builder: add a tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Builder: add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Builder: set stdin for a command or script. Ignored for functions.
    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        match &mut self.kind {
            ExecutionKind::Command { stdin, .. } | ExecutionKind::Script { stdin, .. } => {
                *stdin = Some(input.into());
            }
            ExecutionKind::Function { .. } => {}
        }
        self
    }

    /// Builder: stage a host file into a command's workspace.
    pub fn with_input(mut self, path: impl Into<PathBuf>) -> Self {
        if let ExecutionKind::Command { inputs, .. } = &mut self.kind {
            inputs.push(path.into());
        }
        self
    }

    /// Structural checks that do not depend on engine state.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match &self.kind {
            ExecutionKind::Function { function, .. } if function.trim().is_empty() => {
                return Err(ValidationError::MissingField("function name"));
            }
            ExecutionKind::Command { argv, .. }
                if argv.first().is_none_or(|program| program.is_empty()) =>
            {
                return Err(ValidationError::EmptyCommand);
            }
            ExecutionKind::Script { language, .. } if language.trim().is_empty() => {
                return Err(ValidationError::MissingField("language"));
            }
            ExecutionKind::Script { source, .. } if source.trim().is_empty() => {
                return Err(ValidationError::EmptySource);
            }
            _ => {}
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(ValidationError::ZeroTimeout);
        }
        if let Some(policy) = &self.policy {
            policy.validate().map_err(ValidationError::InvalidPolicy)?;
        }
        Ok(())
    }
}

/// A stored task record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub description: Option<String>,
    pub kind: ExecutionKind,
    /// Only [`TaskStore::update_status`](crate::storage::TaskStore::update_status) changes this after insert.
    pub status: TaskStatus,
    pub priority: Priority,
    pub dependencies: Vec<TaskId>,
    pub retry: RetryPolicy,
    /// Retries consumed so far; also the attempt number of the next execution.
    pub retry_count: u32,
    #[serde(with = "serde_duration")]
    pub timeout: Duration,
    pub scheduled_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub recurrence: Option<Recurrence>,
    pub policy: Option<SandboxPolicy>,
    pub tags: Vec<String>,
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Build the initial record for an admitted spec.
    ///
    /// Status is `Scheduled` if `scheduled_time` is in the future, otherwise `Pending`.
    /// A recurring spec without a scheduled time first runs one interval from `now`.
    pub fn from_spec(
        id: TaskId,
        spec: TaskSpec,
        now: DateTime<Utc>,
        default_timeout: Duration,
    ) -> Self {
        let scheduled_time = spec
            .scheduled_time
            .or_else(|| spec.recurrence.map(|r| r.next_after(now)));
        let status = match scheduled_time {
            Some(at) if at > now => TaskStatus::Scheduled,
            _ => TaskStatus::Pending,
        };
        let name = if spec.name.trim().is_empty() {
            spec.kind.default_name()
        } else {
            spec.name
        };
        let mut dependencies = spec.dependencies;
        let mut seen = std::collections::HashSet::new();
        dependencies.retain(|dep| seen.insert(dep.clone()));

        Self {
            id,
            name,
            description: spec.description,
            kind: spec.kind,
            status,
            priority: spec.priority,
            dependencies,
            retry: spec.retry,
            retry_count: 0,
            timeout: spec.timeout.unwrap_or(default_timeout),
            scheduled_time,
            recurrence: spec.recurrence,
            policy: spec.policy,
            tags: spec.tags,
            metadata: spec.metadata,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Fresh record for the next run of a recurring task, due one interval after `now`.
    ///
    /// Dependencies are not carried over; they gated the first run only.
    pub fn next_occurrence(&self, id: TaskId, now: DateTime<Utc>) -> Option<Task> {
        let recurrence = self.recurrence?;
        Some(Task {
            id,
            status: TaskStatus::Scheduled,
            dependencies: Vec::new(),
            retry_count: 0,
            scheduled_time: Some(recurrence.next_after(now)),
            created_at: now,
            started_at: None,
            completed_at: None,
            ..self.clone()
        })
    }

    /// Maximum retries allowed by the task's policy.
    pub fn max_retries(&self) -> u32 {
        self.retry.max_attempts
    }

    /// Coarse category.
    pub fn task_kind(&self) -> TaskKind {
        self.kind.kind()
    }

    /// Lightweight listing view.
    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            kind: self.task_kind(),
            status: self.status,
            priority: self.priority,
            retry_count: self.retry_count,
            tags: self.tags.clone(),
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

/// Listing view of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub name: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub priority: Priority,
    pub retry_count: u32,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}
