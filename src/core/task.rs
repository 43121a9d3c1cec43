//! Registered task functions and their error type.
//!
//! A `Function` task names a callable registered with the engine's
//! [`FunctionRegistry`](super::registry::FunctionRegistry). Implement
//! [`TaskFunction`] (or register a closure) to make in-process work
//! schedulable next to sandboxed commands and scripts.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use super::cancel::CancelToken;
use super::types::TaskId;

/// Errors a task function can return.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Function failed with a message.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// Function rejected its arguments.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// Function observed its cancellation token and stopped.
    #[error("cancelled")]
    Cancelled,

    /// A transient error that may succeed on retry.
    #[error("transient error: {0}")]
    Transient(String),

    /// Generic error wrapper.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl TaskError {
    /// Check if this error is considered transient (eligible for transient-only retries).
    pub fn is_transient(&self) -> bool {
        matches!(self, TaskError::Transient(_))
    }
}

/// Context handed to a task function for one attempt.
#[derive(Debug, Clone)]
pub struct FunctionContext {
    /// Task being executed.
    pub task_id: TaskId,
    /// Attempt number (equals the task's retry count when the attempt began).
    pub attempt: u32,
    /// Arguments from the task's execution kind.
    pub args: Value,
    /// Cancellation token; long-running functions should poll or await it.
    pub cancel: CancelToken,
}

/// An in-process callable that can be scheduled as a `Function` task.
///
/// # Example
///
/// ```ignore
/// use corral::{FunctionContext, TaskError, TaskFunction};
/// use async_trait::async_trait;
/// use serde_json::{json, Value};
///
/// struct Double;
///
/// #[async_trait]
/// impl TaskFunction for Double {
///     async fn call(&self, ctx: FunctionContext) -> Result<Value, TaskError> {
///         let n = ctx.args.as_i64().ok_or_else(|| TaskError::InvalidArgs("expected integer".into()))?;
///         Ok(json!(n * 2))
///     }
/// }
/// ```
#[async_trait]
pub trait TaskFunction: Send + Sync {
    /// Run the function for one attempt and return its value.
    async fn call(&self, ctx: FunctionContext) -> Result<Value, TaskError>;
}
