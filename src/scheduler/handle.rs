//! Engine handle for submitting and controlling tasks.
//!
//! This module provides the `EngineHandle` type. Every operation is a
//! command sent to the dispatcher loop, which owns all state transitions.

use std::sync::Arc;

use tokio::sync::{RwLock, mpsc, oneshot};

use crate::core::model::{TaskSpec, TaskStatus, TaskSummary};
use crate::core::result::TaskResult;
use crate::core::types::TaskId;
use crate::storage::TaskFilter;

use super::types::{EngineCommand, EngineError, EngineState, EngineStats};

/// Buffer size for the command channel between EngineHandle and the dispatcher.
pub(crate) const COMMAND_CHANNEL_BUFFER: usize = 32;

/// Handle for controlling a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    pub(crate) command_tx: mpsc::Sender<EngineCommand>,
    pub(crate) state: Arc<RwLock<EngineState>>,
}

impl EngineHandle {
    /// Helper to send a command that returns a result and wait for response.
    async fn send_result_command<T>(
        &self,
        build_command: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> EngineCommand,
        operation: &str,
    ) -> Result<T, EngineError>
    where
        T: Send + 'static,
    {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build_command(response_tx))
            .await
            .map_err(|_| EngineError::ChannelError(format!("failed to send {} command", operation)))?;

        response_rx.await.map_err(|_| {
            EngineError::ChannelError(format!("failed to receive {} response", operation))
        })?
    }

    /// Helper to send a command that returns unit and wait for response.
    async fn send_unit_command(
        &self,
        build_command: impl FnOnce(oneshot::Sender<()>) -> EngineCommand,
        operation: &str,
    ) -> Result<(), EngineError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build_command(response_tx))
            .await
            .map_err(|_| EngineError::ChannelError(format!("failed to send {} command", operation)))?;

        response_rx.await.map_err(|_| {
            EngineError::ChannelError(format!("failed to receive {} response", operation))
        })?;

        Ok(())
    }

    /// Admit a task and return its id.
    ///
    /// Malformed specs, unknown functions, and scripts whose language has no
    /// installed toolchain are rejected here. A dependency on an id that does
    /// not exist is accepted, and the task then fails with `UnknownDependency`.
    pub async fn submit(&self, spec: TaskSpec) -> Result<TaskId, EngineError> {
        if !self.is_running().await {
            return Err(EngineError::ShuttingDown);
        }
        self.send_result_command(|response| EngineCommand::Submit { spec, response }, "submit")
            .await
    }

    /// Current status of a task.
    pub async fn status(&self, id: impl Into<TaskId>) -> Result<TaskStatus, EngineError> {
        let id = id.into();
        self.send_result_command(|response| EngineCommand::Status { id, response }, "status")
            .await
    }

    /// Result of the latest finished attempt, if any.
    pub async fn result(&self, id: impl Into<TaskId>) -> Result<Option<TaskResult>, EngineError> {
        let id = id.into();
        self.send_result_command(|response| EngineCommand::Result { id, response }, "result")
            .await
    }

    /// Cancel a task.
    ///
    /// Returns `false` if the task had already finished. A running task is
    /// signalled and reaches `Cancelled` once its worker reports back.
    pub async fn cancel(&self, id: impl Into<TaskId>) -> Result<bool, EngineError> {
        let id = id.into();
        self.send_result_command(|response| EngineCommand::Cancel { id, response }, "cancel")
            .await
    }

    /// List tasks matching `filter`, oldest first.
    pub async fn list(&self, filter: TaskFilter) -> Result<Vec<TaskSummary>, EngineError> {
        self.send_result_command(|response| EngineCommand::List { filter, response }, "list")
            .await
    }

    /// Hold a pending or ready task back from dispatch.
    pub async fn pause(&self, id: impl Into<TaskId>) -> Result<bool, EngineError> {
        let id = id.into();
        self.send_result_command(|response| EngineCommand::Pause { id, response }, "pause")
            .await
    }

    /// Release a paused task.
    pub async fn resume(&self, id: impl Into<TaskId>) -> Result<bool, EngineError> {
        let id = id.into();
        self.send_result_command(|response| EngineCommand::Resume { id, response }, "resume")
            .await
    }

    /// Receiver that yields the task's final result.
    ///
    /// Resolves immediately for a task that has already finished.
    pub async fn subscribe(
        &self,
        id: impl Into<TaskId>,
    ) -> Result<oneshot::Receiver<TaskResult>, EngineError> {
        let id = id.into();
        self.send_result_command(
            |response| EngineCommand::Subscribe { id, response },
            "subscribe",
        )
        .await
    }

    /// Wait until the task reaches a final state and return its last result.
    pub async fn wait(&self, id: impl Into<TaskId>) -> Result<TaskResult, EngineError> {
        let rx = self.subscribe(id).await?;
        rx.await
            .map_err(|_| EngineError::ChannelError("engine stopped before task finished".to_string()))
    }

    /// Counters for the whole engine.
    pub async fn stats(&self) -> Result<EngineStats, EngineError> {
        self.send_result_command(|response| EngineCommand::Stats { response }, "stats")
            .await
    }

    /// Stop accepting work and wait for in-flight tasks to drain.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.send_unit_command(|response| EngineCommand::Shutdown { response }, "shutdown")
            .await
    }

    /// Get the current engine state.
    pub async fn state(&self) -> EngineState {
        *self.state.read().await
    }

    /// Check if the engine is accepting work.
    pub async fn is_running(&self) -> bool {
        *self.state.read().await == EngineState::Running
    }
}
