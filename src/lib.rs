//! corral - sandboxed code execution and priority task scheduling.
//!
//! Tasks are registered functions, external commands, or source code in one
//! of the supported languages. Commands and code run inside a
//! [`ProcessSandbox`] with memory, CPU, wall-clock, process, and file-size
//! limits. The [`Engine`] orders ready work by priority, resolves
//! dependencies, retries failures, and recovers interrupted work from its
//! [`TaskStore`] on start.
//!
//! ```ignore
//! use corral::{Engine, FunctionRegistry, InMemoryStore, TaskSpec};
//! use serde_json::json;
//!
//! let registry = FunctionRegistry::new().with_fn("answer", |_ctx| async { Ok(json!(42)) });
//! let (handle, _engine) = Engine::new(InMemoryStore::new())
//!     .with_registry(registry)
//!     .start()
//!     .await?;
//!
//! let id = handle.submit(TaskSpec::function("answer", json!(null))).await?;
//! let result = handle.wait(id).await?;
//! assert_eq!(result.value, Some(json!(42)));
//! ```

pub mod config;
pub mod core;
pub mod events;
pub mod pipeline;
pub mod sandbox;
pub mod scheduler;
pub mod storage;
pub mod testing;

pub use config::{
    ConfigError, EngineConfig, StorageConfig, TaskEntry, TaskFile, YamlLoader, submit_task_file,
};
pub use core::cancel::{CancelHandle, CancelToken, cancel_pair};
pub use core::clock::{Clock, ManualClock, SystemClock};
pub use core::model::{
    ExecutionKind, Priority, Task, TaskKind, TaskSpec, TaskStatus, TaskSummary, ValidationError,
};
pub use core::policy::{MemoryEnforcement, SandboxPolicy};
pub use core::registry::FunctionRegistry;
pub use core::result::{FailureKind, ResourceKind, TaskResult};
pub use core::retry::{Backoff, RetryCondition, RetryPolicy};
pub use core::schedule::{IntervalUnit, Recurrence, ScheduleError};
pub use core::task::{FunctionContext, TaskError, TaskFunction};
pub use core::types::TaskId;
pub use events::{Event, EventBus, EventHandler};
pub use pipeline::{ExecutionOutcome, ExecutionPipeline, PipelineError, ScriptRequest, Toolchains};
pub use sandbox::{ProcessSandbox, SandboxConfig, SandboxError, SandboxOutput, SandboxRequest};
pub use scheduler::{Engine, EngineError, EngineHandle, EngineState, EngineStats, ReadyQueue};
#[cfg(feature = "sqlite")]
pub use storage::SqliteStore;
pub use storage::{
    ImportSummary, InMemoryStore, StorageError, StoreDump, TaskFilter, TaskPatch, TaskStore,
};
