//! Engine implementation.
//!
//! The engine owns a single dispatcher task that makes every state
//! transition, a pool of workers that run attempts, and the channels between
//! them. Callers talk to the dispatcher through an [`EngineHandle`].

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::EngineConfig;
use crate::core::cancel::{CancelHandle, cancel_pair};
use crate::core::clock::{Clock, SystemClock, add_saturating, sub_saturating};
use crate::core::model::{ExecutionKind, Task, TaskSpec, TaskStatus, TaskSummary, ValidationError};
use crate::core::registry::FunctionRegistry;
use crate::core::result::{FailureKind, TaskResult};
use crate::core::types::TaskId;
use crate::events::{Event, EventBus};
use crate::pipeline::{ExecutionPipeline, PipelineError, Toolchains};
use crate::sandbox::ProcessSandbox;
use crate::storage::{StorageError, TaskFilter, TaskPatch, TaskStore};

use super::handle::{COMMAND_CHANNEL_BUFFER, EngineHandle};
use super::queue::ReadyQueue;
use super::types::{EngineCommand, EngineError, EngineState, EngineStats};
use super::worker::{self, Assignment, Executors, WorkerMessage};

/// Task scheduling engine.
///
/// Generic over the storage backend. Configure with the `with_*` builders,
/// register event handlers on [`event_bus`](Self::event_bus), then call
/// [`start`](Self::start).
pub struct Engine<S: TaskStore> {
    storage: Arc<S>,
    config: EngineConfig,
    registry: FunctionRegistry,
    clock: Arc<dyn Clock>,
    event_bus: Arc<EventBus>,
    toolchains: Option<Toolchains>,
}

impl<S: TaskStore + 'static> Engine<S> {
    /// Create an engine with default settings.
    pub fn new(storage: S) -> Self {
        Self::with_storage(Arc::new(storage))
    }

    /// Create an engine over shared storage.
    pub fn with_storage(storage: Arc<S>) -> Self {
        Self {
            storage,
            config: EngineConfig::default(),
            registry: FunctionRegistry::new(),
            clock: Arc::new(SystemClock),
            event_bus: Arc::new(EventBus::new()),
            toolchains: None,
        }
    }

    /// Replace all settings.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the functions available to `Function` tasks.
    pub fn with_registry(mut self, registry: FunctionRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Set the time source.
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Set the event bus.
    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Arc::new(event_bus);
        self
    }

    /// Use a fixed toolchain table instead of searching the host `PATH`.
    pub fn with_toolchains(mut self, toolchains: Toolchains) -> Self {
        self.toolchains = Some(toolchains);
        self
    }

    /// Set the number of workers.
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.config.pool_size = pool_size;
        self
    }

    /// Set the tick interval.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.config.tick_interval = interval;
        self
    }

    /// Set the graceful shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Get a reference to the event bus.
    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Current settings.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Recover persisted work, start the workers, and return a handle.
    pub async fn start(self) -> Result<(EngineHandle, JoinHandle<()>), EngineError> {
        self.config.validate()?;

        let toolchains = self.toolchains.unwrap_or_else(Toolchains::discover);
        let sandbox = ProcessSandbox::with_config(self.config.sandbox.clone());
        let pipeline = ExecutionPipeline::new(sandbox.clone(), toolchains);
        let registry = Arc::new(self.registry);

        let executors = Executors {
            registry: Arc::clone(&registry),
            sandbox,
            pipeline: pipeline.clone(),
            default_policy: self.config.default_policy.clone(),
            clock: Arc::clone(&self.clock),
        };
        let (assign_tx, assign_rx) = mpsc::unbounded_channel();
        let (report_tx, report_rx) = mpsc::unbounded_channel();

        let mut dispatcher = Dispatcher {
            storage: self.storage,
            config: self.config,
            registry,
            pipeline,
            clock: self.clock,
            event_bus: self.event_bus,
            queue: ReadyQueue::new(),
            in_flight: HashMap::new(),
            assign_tx: Some(assign_tx),
            next_dispatch: 0,
            subscribers: HashMap::new(),
            crash_counts: HashMap::new(),
            attempts: AttemptStats::default(),
            last_sweep: None,
            stranded: false,
        };
        let recovered = dispatcher.recover().await?;
        if recovered > 0 {
            tracing::info!(recovered, "Recovered interrupted tasks");
        }

        let workers = worker::spawn_pool(
            dispatcher.config.pool_size,
            executors,
            assign_rx,
            report_tx,
            dispatcher.config.heartbeat_interval,
        );
        tracing::info!(pool_size = workers.len(), "Engine started");

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let state = Arc::new(RwLock::new(EngineState::Running));
        let handle = EngineHandle {
            command_tx,
            state: Arc::clone(&state),
        };

        let engine_task = tokio::spawn(async move {
            dispatcher.run(command_rx, report_rx, state).await;
            for worker in workers {
                if !worker.is_finished() {
                    worker.abort();
                }
            }
        });

        Ok((handle, engine_task))
    }
}

/// Bookkeeping for an attempt handed to a worker.
struct InFlight {
    dispatch_id: u64,
    cancel: CancelHandle,
    last_heartbeat: Instant,
}

#[derive(Debug, Default)]
struct AttemptStats {
    successful: u64,
    failed: u64,
    total_duration: Duration,
}

impl AttemptStats {
    fn record(&mut self, result: &TaskResult) {
        match result.status {
            TaskStatus::Completed => self.successful += 1,
            TaskStatus::Failed => self.failed += 1,
            _ => return,
        }
        self.total_duration += result.duration;
    }

    fn average(&self) -> Option<Duration> {
        let count = self.successful + self.failed;
        u32::try_from(count)
            .ok()
            .filter(|n| *n > 0)
            .map(|n| self.total_duration / n)
    }
}

/// Owns all task state transitions.
struct Dispatcher<S: TaskStore> {
    storage: Arc<S>,
    config: EngineConfig,
    registry: Arc<FunctionRegistry>,
    pipeline: ExecutionPipeline,
    clock: Arc<dyn Clock>,
    event_bus: Arc<EventBus>,
    queue: ReadyQueue,
    in_flight: HashMap<TaskId, InFlight>,
    assign_tx: Option<mpsc::UnboundedSender<Assignment>>,
    next_dispatch: u64,
    subscribers: HashMap<TaskId, Vec<oneshot::Sender<TaskResult>>>,
    crash_counts: HashMap<TaskId, u32>,
    attempts: AttemptStats,
    last_sweep: Option<Instant>,
    /// A failed dispatch may have dropped a Ready task from the queue.
    stranded: bool,
}

impl<S: TaskStore> Dispatcher<S> {
    /// Main dispatcher loop.
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<EngineCommand>,
        mut report_rx: mpsc::UnboundedReceiver<WorkerMessage>,
        state: Arc<RwLock<EngineState>>,
    ) {
        let mut interval = tokio::time::interval(self.config.tick_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }

                Some(message) = report_rx.recv() => {
                    self.on_report(message).await;
                }

                command = command_rx.recv() => {
                    match command {
                        Some(EngineCommand::Shutdown { response }) => {
                            self.shutdown(&mut report_rx, &state).await;
                            let _ = response.send(());
                            break;
                        }
                        Some(command) => self.handle_command(command).await,
                        None => {
                            tracing::info!("All engine handles dropped, shutting down");
                            self.shutdown(&mut report_rx, &state).await;
                            break;
                        }
                    }
                }
            }

            self.dispatch().await;
        }
    }

    async fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Submit { spec, response } => {
                let result = self.submit(spec).await;
                let _ = response.send(result);
            }
            EngineCommand::Status { id, response } => {
                let result = self.lookup(&id).await.map(|task| task.status);
                let _ = response.send(result);
            }
            EngineCommand::Result { id, response } => {
                let result = match self.lookup(&id).await {
                    Ok(_) => self.storage.latest_result(&id).await.map_err(Into::into),
                    Err(e) => Err(e),
                };
                let _ = response.send(result);
            }
            EngineCommand::Cancel { id, response } => {
                let result = self.cancel(&id).await;
                let _ = response.send(result);
            }
            EngineCommand::List { filter, response } => {
                let result = self
                    .storage
                    .list(&filter)
                    .await
                    .map(|tasks| tasks.iter().map(Task::summary).collect::<Vec<TaskSummary>>())
                    .map_err(Into::into);
                let _ = response.send(result);
            }
            EngineCommand::Pause { id, response } => {
                let result = self.pause(&id).await;
                let _ = response.send(result);
            }
            EngineCommand::Resume { id, response } => {
                let result = self.resume(&id).await;
                let _ = response.send(result);
            }
            EngineCommand::Subscribe { id, response } => {
                let result = self.subscribe(&id).await;
                let _ = response.send(result);
            }
            EngineCommand::Stats { response } => {
                let result = self.stats().await;
                let _ = response.send(result);
            }
            EngineCommand::Shutdown { response } => {
                // Handled by the loop; kept for exhaustiveness.
                let _ = response.send(());
            }
        }
    }

    /// Get a task, mapping a missing id to `EngineError::NotFound`.
    async fn lookup(&self, id: &TaskId) -> Result<Task, EngineError> {
        match self.storage.get(id).await {
            Ok(task) => Ok(task),
            Err(StorageError::NotFound(_)) => Err(EngineError::NotFound(id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    // Admission

    async fn submit(&mut self, spec: TaskSpec) -> Result<TaskId, EngineError> {
        spec.validate()?;
        let default_timeout = match &spec.kind {
            ExecutionKind::Function { function, .. } => {
                if !self.registry.contains(function) {
                    return Err(ValidationError::UnknownFunction(function.clone()).into());
                }
                self.config.default_timeout
            }
            ExecutionKind::Script { language, .. } => {
                let language_spec = self.pipeline.check(language).map_err(|e| match e {
                    PipelineError::ToolchainUnavailable(name) => {
                        ValidationError::ToolchainUnavailable(name)
                    }
                    _ => ValidationError::UnknownLanguage(language.clone()),
                })?;
                language_spec.default_timeout
            }
            ExecutionKind::Command { .. } => self.config.default_timeout,
        };

        let id = TaskId::generate();
        let task = Task::from_spec(id.clone(), spec, self.clock.now(), default_timeout);
        let (name, priority, status) = (task.name.clone(), task.priority, task.status);
        self.storage.put(task).await?;

        tracing::debug!(task_id = %id, name = %name, status = %status, "Task submitted");
        self.event_bus
            .emit(Event::task_submitted(id.clone(), name, priority))
            .await;

        if status == TaskStatus::Pending {
            self.evaluate(&id).await?;
        }
        Ok(id)
    }

    /// Move a Pending task forward if its dependencies allow it.
    ///
    /// Returns `true` if the task was failed because a dependency is missing
    /// or did not complete; the caller must then propagate.
    async fn evaluate(&mut self, id: &TaskId) -> Result<bool, EngineError> {
        let task = self.storage.get(id).await?;
        if task.status != TaskStatus::Pending {
            return Ok(false);
        }

        for dep in &task.dependencies {
            match self.storage.get(dep).await {
                Ok(upstream) => match upstream.status {
                    TaskStatus::Completed => {}
                    TaskStatus::Failed | TaskStatus::Cancelled => {
                        let message = format!("DependencyFailed: dependency {} did not complete", dep);
                        return self
                            .finish_queued(&task, FailureKind::DependencyFailed, message)
                            .await;
                    }
                    _ => return Ok(false),
                },
                Err(StorageError::NotFound(_)) => {
                    let message = format!("UnknownDependency: no task with id {}", dep);
                    return self
                        .finish_queued(&task, FailureKind::UnknownDependency, message)
                        .await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        if self
            .storage
            .update_status(id, TaskStatus::Pending, TaskStatus::Ready)
            .await?
        {
            self.queue.push(id.clone(), task.priority, task.created_at);
        }
        Ok(false)
    }

    /// Evaluate and propagate in one step.
    async fn advance(&mut self, id: &TaskId) -> Result<(), EngineError> {
        if self.evaluate(id).await? {
            self.propagate(id).await?;
        }
        Ok(())
    }

    /// End a task that is not running (or whose worker is gone) without an attempt.
    ///
    /// Returns whether this call made the transition.
    async fn finish_queued(
        &mut self,
        task: &Task,
        failure: FailureKind,
        message: String,
    ) -> Result<bool, EngineError> {
        let target = if failure == FailureKind::Cancelled {
            TaskStatus::Cancelled
        } else {
            TaskStatus::Failed
        };
        if !self
            .storage
            .update_status(&task.id, task.status, target)
            .await?
        {
            return Ok(false);
        }
        self.queue.remove(&task.id);

        let now = self.clock.now();
        let started = task.started_at.unwrap_or(now);
        let result = TaskResult::failure(
            task.id.clone(),
            task.retry_count,
            failure,
            message.clone(),
            started,
            now,
        );
        self.record(&result).await;
        self.storage
            .patch(&task.id, TaskPatch::new().completed_at(Some(now)))
            .await?;

        tracing::info!(task_id = %task.id, failure = %failure, "{}", message);
        let event = match target {
            TaskStatus::Cancelled => Event::task_cancelled(task.id.clone()),
            _ => Event::task_failed(task.id.clone(), task.retry_count, failure, message),
        };
        self.event_bus.emit(event).await;
        self.resolve(result);
        Ok(true)
    }

    /// Fan out a final state to dependents.
    ///
    /// Completion re-evaluates Pending dependents. Failure or cancellation
    /// fails every waiting dependent, transitively.
    async fn propagate(&mut self, root: &TaskId) -> Result<(), EngineError> {
        let mut work = VecDeque::from([root.clone()]);

        while let Some(id) = work.pop_front() {
            let status = self.storage.get(&id).await?.status;
            let waiting = self
                .storage
                .list(
                    &TaskFilter::all()
                        .with_status(TaskStatus::Scheduled)
                        .with_status(TaskStatus::Pending)
                        .with_status(TaskStatus::Paused),
                )
                .await?;

            for dependent in waiting.into_iter().filter(|t| t.dependencies.contains(&id)) {
                let failed = match status {
                    TaskStatus::Completed => self.evaluate(&dependent.id).await?,
                    TaskStatus::Failed | TaskStatus::Cancelled => {
                        let message =
                            format!("DependencyFailed: dependency {} did not complete", id);
                        self.finish_queued(&dependent, FailureKind::DependencyFailed, message)
                            .await?
                    }
                    _ => false,
                };
                if failed {
                    work.push_back(dependent.id);
                }
            }
        }
        Ok(())
    }

    // Dispatch

    async fn dispatch(&mut self) {
        let Some(assign_tx) = self.assign_tx.clone() else {
            return;
        };
        while self.in_flight.len() < self.config.pool_size {
            let Some(id) = self.queue.pop() else {
                break;
            };
            if let Err(e) = self.start_task(&id, &assign_tx).await {
                // Retried on the next pass.
                tracing::warn!(task_id = %id, error = %e, "Failed to dispatch task");
                self.stranded = true;
                break;
            }
        }
    }

    async fn start_task(
        &mut self,
        id: &TaskId,
        assign_tx: &mpsc::UnboundedSender<Assignment>,
    ) -> Result<(), EngineError> {
        let mut task = self.storage.get(id).await?;
        if !self
            .storage
            .update_status(id, TaskStatus::Ready, TaskStatus::Running)
            .await?
        {
            tracing::debug!(task_id = %id, "Task left Ready before dispatch");
            return Ok(());
        }
        let now = self.clock.now();
        if let Err(e) = self
            .storage
            .patch(id, TaskPatch::new().started_at(Some(now)))
            .await
        {
            self.unstart(&task).await;
            return Err(e.into());
        }
        task.status = TaskStatus::Running;
        task.started_at = Some(now);
        let attempt = task.retry_count;

        let (handle, token) = cancel_pair();
        self.next_dispatch += 1;
        let dispatch_id = self.next_dispatch;
        self.in_flight.insert(
            id.clone(),
            InFlight {
                dispatch_id,
                cancel: handle,
                last_heartbeat: Instant::now(),
            },
        );

        tracing::debug!(task_id = %id, attempt, "Dispatching task");
        self.event_bus
            .emit(Event::task_started(id.clone(), attempt))
            .await;

        if assign_tx
            .send(Assignment {
                dispatch_id,
                task,
                cancel: token,
            })
            .is_err()
        {
            self.in_flight.remove(id);
            self.storage
                .update_status(id, TaskStatus::Running, TaskStatus::Pending)
                .await?;
            return Err(EngineError::ChannelError(
                "worker pool is closed".to_string(),
            ));
        }
        Ok(())
    }

    /// Put a task that failed to start back in the queue.
    async fn unstart(&mut self, task: &Task) {
        match self
            .storage
            .update_status(&task.id, TaskStatus::Running, TaskStatus::Ready)
            .await
        {
            Ok(true) => self.queue.push(task.id.clone(), task.priority, task.created_at),
            Ok(false) => {}
            Err(e) => {
                tracing::error!(task_id = %task.id, error = %e, "Task stuck in Running after failed dispatch");
            }
        }
    }

    // Worker reports

    async fn on_report(&mut self, message: WorkerMessage) {
        let outcome = match message {
            WorkerMessage::Heartbeat {
                dispatch_id,
                task_id,
            } => {
                if let Some(flight) = self.in_flight.get_mut(&task_id) {
                    if flight.dispatch_id == dispatch_id {
                        flight.last_heartbeat = Instant::now();
                    }
                }
                Ok(())
            }
            WorkerMessage::Finished {
                dispatch_id,
                task_id,
                result,
            } => self.on_finished(dispatch_id, &task_id, result).await,
            WorkerMessage::Crashed {
                dispatch_id,
                task_id,
                reason,
            } => {
                if self.take_in_flight(&task_id, dispatch_id).is_some() {
                    self.replay(&task_id, &reason).await
                } else {
                    Ok(())
                }
            }
        };
        if let Err(e) = outcome {
            tracing::warn!(error = %e, "Failed to process worker report");
        }
    }

    fn take_in_flight(&mut self, id: &TaskId, dispatch_id: u64) -> Option<InFlight> {
        match self.in_flight.get(id) {
            Some(flight) if flight.dispatch_id == dispatch_id => self.in_flight.remove(id),
            _ => None,
        }
    }

    async fn on_finished(
        &mut self,
        dispatch_id: u64,
        id: &TaskId,
        result: TaskResult,
    ) -> Result<(), EngineError> {
        if self.take_in_flight(id, dispatch_id).is_none() {
            tracing::debug!(task_id = %id, dispatch_id, "Ignoring report from a replaced attempt");
            return Ok(());
        }
        self.crash_counts.remove(id);

        let target = match result.status {
            TaskStatus::Completed | TaskStatus::Cancelled => result.status,
            _ => TaskStatus::Failed,
        };
        if !self
            .storage
            .update_status(id, TaskStatus::Running, target)
            .await?
        {
            tracing::warn!(task_id = %id, status = %target, "Task left Running before its attempt reported, dropping result");
            return Ok(());
        }
        self.attempts.record(&result);
        self.record(&result).await;

        let task = self.storage.get(id).await?;
        let completed_at = TaskPatch::new().completed_at(Some(result.finished_at));

        match target {
            TaskStatus::Completed => {
                self.storage.patch(id, completed_at).await?;
                tracing::info!(task_id = %id, duration = ?result.duration, "Task completed");
                self.event_bus
                    .emit(Event::task_completed(
                        id.clone(),
                        result.attempt,
                        result.duration,
                        result.exit_code,
                    ))
                    .await;
                self.resolve(result);
                self.propagate(id).await?;
                self.schedule_next_occurrence(&task).await
            }
            TaskStatus::Cancelled => {
                self.storage.patch(id, completed_at).await?;
                tracing::info!(task_id = %id, "Task cancelled while running");
                self.event_bus.emit(Event::task_cancelled(id.clone())).await;
                self.resolve(result);
                self.propagate(id).await
            }
            _ => {
                let failure = result.failure.unwrap_or(FailureKind::FunctionError);
                let error = result.error.clone().unwrap_or_default();
                tracing::warn!(task_id = %id, attempt = result.attempt, failure = %failure, error = %error, "Task attempt failed");
                self.event_bus
                    .emit(Event::task_failed(id.clone(), result.attempt, failure, error))
                    .await;

                if failure.is_retryable()
                    && task.retry.should_retry(task.retry_count, failure.is_transient())
                {
                    self.schedule_retry(&task).await
                } else {
                    self.storage.patch(id, completed_at).await?;
                    self.resolve(result);
                    self.propagate(id).await?;
                    self.schedule_next_occurrence(&task).await
                }
            }
        }
    }

    /// Move a Failed task with retry budget back into the queue.
    async fn schedule_retry(&mut self, task: &Task) -> Result<(), EngineError> {
        let next = task.retry_count + 1;
        let delay = task.retry.delay_for(next);
        tracing::info!(task_id = %task.id, retry = next, max_retries = task.max_retries(), delay = ?delay, "Retrying task");
        self.event_bus
            .emit(Event::task_retrying(
                task.id.clone(),
                next,
                task.max_retries(),
                delay,
            ))
            .await;

        let patch = TaskPatch::new().retry_count(next).started_at(None);
        if delay.is_zero() {
            self.storage
                .patch(&task.id, patch.scheduled_time(None))
                .await?;
            self.storage
                .update_status(&task.id, TaskStatus::Failed, TaskStatus::Pending)
                .await?;
            self.advance(&task.id).await
        } else {
            let at = add_saturating(self.clock.now(), delay);
            self.storage
                .patch(&task.id, patch.scheduled_time(Some(at)))
                .await?;
            self.storage
                .update_status(&task.id, TaskStatus::Failed, TaskStatus::Scheduled)
                .await?;
            Ok(())
        }
    }

    /// Insert the next run of a recurring task as a new Scheduled task.
    ///
    /// The timer sweep releases it once its time comes.
    async fn schedule_next_occurrence(&mut self, task: &Task) -> Result<(), EngineError> {
        let id = TaskId::generate();
        let Some(next) = task.next_occurrence(id.clone(), self.clock.now()) else {
            return Ok(());
        };
        let (name, priority, at) = (next.name.clone(), next.priority, next.scheduled_time);
        self.storage.put(next).await?;

        tracing::info!(task_id = %id, previous = %task.id, scheduled_time = ?at, "Next occurrence scheduled");
        self.event_bus
            .emit(Event::task_submitted(id, name, priority))
            .await;
        Ok(())
    }

    /// Return a task whose worker was lost to the queue.
    ///
    /// After `max_crash_replays` replays the task fails with `WorkerCrashed`.
    async fn replay(&mut self, id: &TaskId, reason: &str) -> Result<(), EngineError> {
        let count = self.crash_counts.entry(id.clone()).or_insert(0);
        *count += 1;
        let count = *count;

        let task = self.storage.get(id).await?;
        if task.status != TaskStatus::Running {
            return Ok(());
        }

        if count > self.config.max_crash_replays {
            self.crash_counts.remove(id);
            let message = format!("WorkerCrashed: {} ({} replays)", reason, count - 1);
            tracing::error!(task_id = %id, "{}", message);
            if self
                .finish_queued(&task, FailureKind::WorkerCrashed, message)
                .await?
            {
                self.propagate(id).await?;
            }
            return Ok(());
        }

        tracing::warn!(task_id = %id, reason, replay = count, "Replaying task after worker loss");
        if self
            .storage
            .update_status(id, TaskStatus::Running, TaskStatus::Pending)
            .await?
        {
            self.storage
                .patch(id, TaskPatch::new().started_at(None))
                .await?;
            self.event_bus
                .emit(Event::task_recovered(id.clone(), reason))
                .await;
            self.advance(id).await?;
        }
        Ok(())
    }

    /// Persist an attempt result. A duplicate attempt is logged and kept as is.
    async fn record(&self, result: &TaskResult) {
        if let Err(e) = self.storage.put_result(result.clone()).await {
            tracing::warn!(task_id = %result.task_id, attempt = result.attempt, error = %e, "Failed to record task result");
        }
    }

    /// Wake everyone waiting on the task's final result.
    fn resolve(&mut self, result: TaskResult) {
        if let Some(waiters) = self.subscribers.remove(&result.task_id) {
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        }
    }

    // Caller operations

    async fn cancel(&mut self, id: &TaskId) -> Result<bool, EngineError> {
        let task = self.lookup(id).await?;
        if task.status.is_terminal() {
            return Ok(false);
        }
        if task.status == TaskStatus::Running {
            if let Some(flight) = self.in_flight.get(id) {
                tracing::info!(task_id = %id, "Cancellation requested for running task");
                flight.cancel.cancel();
                return Ok(true);
            }
        }

        self.queue.remove(id);
        let message = if task.status == TaskStatus::Running {
            "Cancelled: cancelled without a live worker"
        } else {
            "Cancelled: cancelled before start"
        };
        if self
            .finish_queued(&task, FailureKind::Cancelled, message.to_string())
            .await?
        {
            self.propagate(id).await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn pause(&mut self, id: &TaskId) -> Result<bool, EngineError> {
        let task = self.lookup(id).await?;
        if !matches!(task.status, TaskStatus::Pending | TaskStatus::Ready) {
            return Ok(false);
        }
        if !self
            .storage
            .update_status(id, task.status, TaskStatus::Paused)
            .await?
        {
            return Ok(false);
        }
        self.queue.remove(id);
        tracing::info!(task_id = %id, "Task paused");
        self.event_bus.emit(Event::task_paused(id.clone())).await;
        Ok(true)
    }

    async fn resume(&mut self, id: &TaskId) -> Result<bool, EngineError> {
        self.lookup(id).await?;
        if !self
            .storage
            .update_status(id, TaskStatus::Paused, TaskStatus::Pending)
            .await?
        {
            return Ok(false);
        }
        tracing::info!(task_id = %id, "Task resumed");
        self.event_bus.emit(Event::task_resumed(id.clone())).await;
        self.advance(id).await?;
        Ok(true)
    }

    async fn subscribe(
        &mut self,
        id: &TaskId,
    ) -> Result<oneshot::Receiver<TaskResult>, EngineError> {
        let task = self.lookup(id).await?;
        let (tx, rx) = oneshot::channel();
        if task.status.is_terminal() {
            if let Some(result) = self.storage.latest_result(id).await? {
                let _ = tx.send(result);
                return Ok(rx);
            }
        }
        self.subscribers.entry(id.clone()).or_default().push(tx);
        Ok(rx)
    }

    async fn stats(&self) -> Result<EngineStats, EngineError> {
        let tasks = self.storage.list(&TaskFilter::all()).await?;
        let mut by_status = BTreeMap::new();
        let mut by_priority = BTreeMap::new();
        let mut by_kind = BTreeMap::new();
        for task in &tasks {
            *by_status.entry(task.status.to_string()).or_insert(0) += 1;
            *by_priority.entry(task.priority.to_string()).or_insert(0) += 1;
            *by_kind.entry(task.task_kind().to_string()).or_insert(0) += 1;
        }

        Ok(EngineStats {
            total_tasks: tasks.len(),
            by_status,
            by_priority,
            by_kind,
            queued: self.queue.len(),
            running: self.in_flight.len(),
            pool_size: self.config.pool_size,
            successful_attempts: self.attempts.successful,
            failed_attempts: self.attempts.failed,
            average_duration: self.attempts.average(),
        })
    }

    // Periodic work

    async fn tick(&mut self) {
        if let Err(e) = self.release_scheduled().await {
            tracing::warn!(error = %e, "Failed to release scheduled tasks");
        }
        self.check_heartbeats().await;
        if self.stranded {
            if let Err(e) = self.requeue_stranded().await {
                tracing::warn!(error = %e, "Failed to requeue ready tasks");
            }
        }

        let due = self
            .last_sweep
            .is_none_or(|at| at.elapsed() >= self.config.retention_sweep_interval);
        if due {
            self.last_sweep = Some(Instant::now());
            if let Err(e) = self.sweep_retention().await {
                tracing::warn!(error = %e, "Retention sweep failed");
            }
        }
    }

    /// Queue Ready tasks that a failed dispatch left out of the queue.
    async fn requeue_stranded(&mut self) -> Result<(), EngineError> {
        for task in self.storage.list_by_status(TaskStatus::Ready).await? {
            if !self.queue.contains(&task.id) {
                tracing::debug!(task_id = %task.id, "Requeueing ready task");
                self.queue.push(task.id.clone(), task.priority, task.created_at);
            }
        }
        self.stranded = false;
        Ok(())
    }

    /// Scheduled tasks whose time has come become Pending.
    async fn release_scheduled(&mut self) -> Result<(), EngineError> {
        let now = self.clock.now();
        for task in self.storage.list_by_status(TaskStatus::Scheduled).await? {
            if task.scheduled_time.is_some_and(|at| at > now) {
                continue;
            }
            if self
                .storage
                .update_status(&task.id, TaskStatus::Scheduled, TaskStatus::Pending)
                .await?
            {
                tracing::debug!(task_id = %task.id, "Scheduled time reached");
                self.advance(&task.id).await?;
            }
        }
        Ok(())
    }

    async fn check_heartbeats(&mut self) {
        let timeout = self.config.heartbeat_timeout;
        let stale: Vec<TaskId> = self
            .in_flight
            .iter()
            .filter(|(_, flight)| flight.last_heartbeat.elapsed() > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for id in stale {
            if let Some(flight) = self.in_flight.remove(&id) {
                flight.cancel.cancel();
                if let Err(e) = self.replay(&id, "worker stopped heartbeating").await {
                    tracing::warn!(task_id = %id, error = %e, "Failed to replay task");
                }
            }
        }
    }

    /// Delete finished tasks older than the retention window.
    ///
    /// A task that an unfinished task still depends on is kept.
    async fn sweep_retention(&mut self) -> Result<usize, EngineError> {
        let cutoff: DateTime<Utc> = sub_saturating(self.clock.now(), self.config.retention);
        let tasks = self.storage.list(&TaskFilter::all()).await?;
        let needed: HashSet<&TaskId> = tasks
            .iter()
            .filter(|t| !t.status.is_terminal())
            .flat_map(|t| t.dependencies.iter())
            .collect();

        let mut removed = 0;
        for task in &tasks {
            let expired = task.status.is_terminal()
                && task.completed_at.is_some_and(|at| at < cutoff)
                && !needed.contains(&task.id);
            if !expired {
                continue;
            }
            match self.storage.delete(&task.id).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "Failed to delete expired task")
                }
            }
        }
        if removed > 0 {
            tracing::info!(removed, "Removed expired tasks");
        }
        Ok(removed)
    }

    // Lifecycle

    /// Requeue work left behind by a previous run.
    ///
    /// Running tasks have no live worker after a restart and go back to
    /// Pending; Ready tasks are re-queued; Pending and due Scheduled tasks
    /// are re-evaluated.
    async fn recover(&mut self) -> Result<usize, EngineError> {
        let mut recovered = 0;

        for task in self.storage.list_by_status(TaskStatus::Ready).await? {
            self.queue.push(task.id.clone(), task.priority, task.created_at);
        }

        for task in self.storage.list_by_status(TaskStatus::Running).await? {
            match self
                .storage
                .update_status(&task.id, TaskStatus::Running, TaskStatus::Pending)
                .await
            {
                Ok(true) => {
                    if let Err(e) = self
                        .storage
                        .patch(&task.id, TaskPatch::new().started_at(None))
                        .await
                    {
                        tracing::warn!(task_id = %task.id, error = %e, "Failed to reset start time during recovery");
                    }
                    self.event_bus
                        .emit(Event::task_recovered(
                            task.id.clone(),
                            "engine restarted while task was running",
                        ))
                        .await;
                    recovered += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "Failed to recover running task");
                }
            }
        }

        for task in self.storage.list_by_status(TaskStatus::Pending).await? {
            if let Err(e) = self.advance(&task.id).await {
                tracing::warn!(task_id = %task.id, error = %e, "Failed to re-evaluate task during recovery");
            }
        }
        self.release_scheduled().await?;

        Ok(recovered)
    }

    /// Stop dispatching and wait for running attempts to report.
    async fn shutdown(
        &mut self,
        report_rx: &mut mpsc::UnboundedReceiver<WorkerMessage>,
        state: &Arc<RwLock<EngineState>>,
    ) {
        *state.write().await = EngineState::ShuttingDown;
        self.await_running_tasks(report_rx).await;

        // Workers exit once the assignment channel closes.
        self.assign_tx = None;
        for (_, waiters) in self.subscribers.drain() {
            drop(waiters);
        }
        *state.write().await = EngineState::Stopped;
        tracing::info!("Engine stopped");
    }

    async fn await_running_tasks(
        &mut self,
        report_rx: &mut mpsc::UnboundedReceiver<WorkerMessage>,
    ) {
        let running_count = self.in_flight.len();
        if running_count == 0 {
            tracing::info!("No running tasks to wait for during shutdown");
            return;
        }

        tracing::info!(
            "Graceful shutdown: waiting for {} running task(s) to complete (timeout: {:?})",
            running_count,
            self.config.shutdown_timeout
        );

        let start = Instant::now();
        let deadline = start + self.config.shutdown_timeout;

        while !self.in_flight.is_empty() {
            match tokio::time::timeout_at(deadline, report_rx.recv()).await {
                Ok(Some(message)) => self.on_report(message).await,
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        "Graceful shutdown timeout ({:?}) exceeded with {} task(s) still running",
                        self.config.shutdown_timeout,
                        self.in_flight.len()
                    );
                    // Left Running in storage; the next start replays them.
                    for flight in self.in_flight.values() {
                        flight.cancel.cancel();
                    }
                    return;
                }
            }
        }

        tracing::info!(
            "All running tasks completed gracefully in {:?}",
            start.elapsed()
        );
    }
}
