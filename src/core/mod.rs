//! Core data model shared by the sandbox, pipeline, storage, and scheduler.

pub mod cancel;
pub mod clock;
pub mod model;
pub mod policy;
pub mod registry;
pub mod result;
pub mod retry;
pub mod schedule;
pub(crate) mod serde_duration;
pub mod task;
pub mod types;
