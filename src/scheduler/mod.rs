//! Scheduler engine for task execution.
//!
//! This module provides the dispatcher loop that admits tasks, resolves
//! dependencies, orders ready work by priority, and hands it to a pool of
//! workers. It also recovers interrupted work on start.

mod engine;
mod handle;
mod queue;
mod types;
mod worker;

pub use engine::Engine;
pub use handle::EngineHandle;
pub use queue::ReadyQueue;
pub use types::{EngineError, EngineState, EngineStats};
