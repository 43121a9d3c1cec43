//! Configuration type definitions.
//!
//! This module contains the engine settings (corral.yaml) and the batch
//! task file format run by the CLI.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::ConfigError;
use crate::core::model::TaskSpec;
use crate::core::policy::SandboxPolicy;
use crate::core::serde_duration;
use crate::sandbox::SandboxConfig;

/// Engine configuration (corral.yaml).
///
/// Every field has a default, so an empty file is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of workers.
    pub pool_size: usize,
    /// How often the dispatcher sweeps timers, heartbeats, and retention.
    #[serde(with = "serde_duration")]
    pub tick_interval: Duration,
    /// How often a busy worker reports it is alive.
    #[serde(with = "serde_duration")]
    pub heartbeat_interval: Duration,
    /// Silence after which a busy worker is treated as crashed.
    #[serde(with = "serde_duration")]
    pub heartbeat_timeout: Duration,
    /// How long finished tasks are kept.
    #[serde(with = "serde_duration")]
    pub retention: Duration,
    /// Minimum time between retention sweeps.
    #[serde(with = "serde_duration")]
    pub retention_sweep_interval: Duration,
    /// Per-attempt timeout for tasks that do not set one.
    #[serde(with = "serde_duration")]
    pub default_timeout: Duration,
    /// How long shutdown waits for running tasks.
    #[serde(with = "serde_duration")]
    pub shutdown_timeout: Duration,
    /// Crash replays allowed per task before it fails with `WorkerCrashed`.
    pub max_crash_replays: u32,
    /// Sandbox limits for tasks that do not carry a policy.
    pub default_policy: SandboxPolicy,
    /// Process sandbox settings.
    pub sandbox: SandboxConfig,
    /// Storage backend.
    pub storage: StorageConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            tick_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(30),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            retention_sweep_interval: Duration::from_secs(60),
            default_timeout: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(30),
            max_crash_replays: 3,
            default_policy: SandboxPolicy::default(),
            sandbox: SandboxConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Builder: set the number of workers.
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Builder: set the dispatcher tick.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Builder: set the heartbeat interval and timeout.
    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }

    /// Builder: set the retention window and how often it is enforced.
    pub fn with_retention(mut self, retention: Duration, sweep_interval: Duration) -> Self {
        self.retention = retention;
        self.retention_sweep_interval = sweep_interval;
        self
    }

    /// Builder: set the default task timeout.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Builder: set the graceful shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Builder: set the default sandbox policy.
    pub fn with_default_policy(mut self, policy: SandboxPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    /// Builder: set the storage backend.
    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "pool_size must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("tick_interval", self.tick_interval),
            ("heartbeat_interval", self.heartbeat_interval),
            ("default_timeout", self.default_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::InvalidConfig(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }
        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(ConfigError::InvalidConfig(
                "heartbeat_timeout must be longer than heartbeat_interval".to_string(),
            ));
        }
        self.default_policy
            .validate()
            .map_err(|e| ConfigError::InvalidConfig(format!("default_policy: {}", e)))?;
        if let StorageConfig::Sqlite { path } = &self.storage {
            if path.trim().is_empty() {
                return Err(ConfigError::MissingField("storage.path".to_string()));
            }
        }
        Ok(())
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    /// In-memory storage (default, non-persistent).
    #[serde(rename = "memory")]
    #[default]
    Memory,
    /// SQLite storage.
    #[serde(rename = "sqlite")]
    Sqlite {
        /// Path to the database file.
        path: String,
    },
}

/// A batch of tasks submitted together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFile {
    pub tasks: Vec<TaskEntry>,
}

/// One task in a batch file.
///
/// `key` names the task within the file; `depends_on` refers to other
/// keys and is resolved to task ids at submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEntry {
    pub key: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(flatten)]
    pub spec: TaskSpec,
}
