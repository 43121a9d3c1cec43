//! Resource limits for sandboxed processes.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Limits applied to one sandboxed process and its descendants.
///
/// Limits are installed in the child before it executes (rlimits) and
/// backed by an out-of-process monitor for memory and wall time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxPolicy {
    /// Memory ceiling in megabytes.
    pub memory_mb: u64,
    /// How the memory ceiling is enforced.
    pub memory_enforcement: MemoryEnforcement,
    /// CPU time in seconds.
    pub cpu_seconds: u64,
    /// Wall-clock time in seconds (fractional values allowed).
    pub wall_seconds: f64,
    /// Maximum processes for the sandbox user (`RLIMIT_NPROC`).
    pub max_processes: u64,
    /// Maximum open file descriptors.
    pub max_open_files: u64,
    /// Largest file the process may write, in megabytes.
    pub max_file_size_mb: u64,
    /// Whether network access is allowed. Not enforced without namespaces.
    pub network_allowed: bool,
    /// Host paths from which input files may be staged into the workspace.
    pub allowed_paths: Vec<PathBuf>,
}

/// Memory enforcement strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryEnforcement {
    /// `RLIMIT_AS` in the child plus resident-set monitoring.
    #[default]
    AddressSpace,
    /// Resident-set monitoring only. For runtimes that reserve large
    /// virtual regions up front (JVM, V8, Go).
    Resident,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            memory_mb: 100,
            memory_enforcement: MemoryEnforcement::AddressSpace,
            cpu_seconds: 30,
            wall_seconds: 30.0,
            max_processes: 1,
            max_open_files: 64,
            max_file_size_mb: 10,
            network_allowed: false,
            allowed_paths: Vec::new(),
        }
    }
}

impl SandboxPolicy {
    /// Builder: set the memory ceiling.
    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        self.memory_mb = memory_mb;
        self
    }

    /// Builder: set the CPU time limit.
    pub fn with_cpu_seconds(mut self, cpu_seconds: u64) -> Self {
        self.cpu_seconds = cpu_seconds;
        self
    }

    /// Builder: set the wall-clock limit.
    pub fn with_wall_time(mut self, wall: Duration) -> Self {
        self.wall_seconds = wall.as_secs_f64();
        self
    }

    /// Builder: set the process limit.
    pub fn with_max_processes(mut self, max_processes: u64) -> Self {
        self.max_processes = max_processes;
        self
    }

    /// Builder: allow staging inputs from a host path.
    pub fn allow_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.allowed_paths.push(path.into());
        self
    }

    /// Builder: switch memory enforcement strategy.
    pub fn with_memory_enforcement(mut self, enforcement: MemoryEnforcement) -> Self {
        self.memory_enforcement = enforcement;
        self
    }

    /// Wall-clock limit as a `Duration`.
    pub fn wall_time(&self) -> Duration {
        Duration::try_from_secs_f64(self.wall_seconds).unwrap_or(Duration::MAX)
    }

    /// Memory ceiling in bytes.
    pub fn memory_bytes(&self) -> u64 {
        self.memory_mb.saturating_mul(1024 * 1024)
    }

    /// Maximum file size in bytes.
    pub fn file_size_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }

    /// Widened policy for a compile phase.
    ///
    /// Compilers fork helpers and map large toolchain images, so memory,
    /// process count, and time are raised to at least the given floors.
    pub fn for_compile(&self, timeout: Duration) -> Self {
        let secs = timeout.as_secs().max(1);
        Self {
            memory_mb: self.memory_mb.max(512),
            memory_enforcement: MemoryEnforcement::Resident,
            cpu_seconds: self.cpu_seconds.max(secs),
            wall_seconds: self.wall_seconds.max(timeout.as_secs_f64()),
            max_processes: self.max_processes.max(64),
            max_open_files: self.max_open_files.max(256),
            max_file_size_mb: self.max_file_size_mb.max(64),
            network_allowed: false,
            allowed_paths: Vec::new(),
        }
    }

    /// Check the policy for values that can never run anything.
    pub fn validate(&self) -> Result<(), String> {
        if self.memory_mb == 0 {
            return Err("memory_mb must be greater than zero".to_string());
        }
        if self.cpu_seconds == 0 {
            return Err("cpu_seconds must be greater than zero".to_string());
        }
        if !(self.wall_seconds.is_finite() && self.wall_seconds > 0.0) {
            return Err("wall_seconds must be a positive number".to_string());
        }
        if Duration::try_from_secs_f64(self.wall_seconds).is_err() {
            return Err("wall_seconds is out of range".to_string());
        }
        if self.max_processes == 0 {
            return Err("max_processes must be greater than zero".to_string());
        }
        if self.max_open_files < 3 {
            return Err("max_open_files must allow stdio (at least 3)".to_string());
        }
        Ok(())
    }
}
