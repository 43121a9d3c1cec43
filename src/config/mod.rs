//! Configuration loading and parsing.
//!
//! This module provides YAML-based configuration for engine settings and
//! batch task files.

mod builder;
mod error;
mod types;
mod yaml;

pub use builder::submit_task_file;
pub use error::ConfigError;
pub use types::{EngineConfig, StorageConfig, TaskEntry, TaskFile};
pub use yaml::YamlLoader;
