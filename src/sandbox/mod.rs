//! Process sandbox: run one external command under enforced limits.
//!
//! [`ProcessSandbox`] spawns a program in a private [`Workspace`] with a
//! scrubbed environment, installs rlimits before `exec`, and supervises the
//! child until it exits or violates its [`SandboxPolicy`]:
//!
//! - a watchdog enforces the wall-clock deadline,
//! - a monitor samples resident memory and CPU time every poll interval,
//! - cancellation is observed through a [`CancelToken`].
//!
//! On violation the whole process group receives `SIGTERM`, then `SIGKILL`
//! after the grace period, and is reaped. Output captured up to that point
//! is returned inside the error.
//!
//! This is resource-limit and subprocess isolation only. It does not use
//! namespaces, seccomp, or cgroups and is not a hardened multi-tenant
//! boundary. `network_allowed` is recorded but not enforced.

mod capture;
mod limits;
mod monitor;
mod workspace;

pub use workspace::Workspace;

use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::core::cancel::CancelToken;
use crate::core::clock::deadline_after;
use crate::core::policy::SandboxPolicy;
use crate::core::result::{FailureKind, ResourceKind};
use crate::core::serde_duration;
use capture::Captured;
use limits::{GroupSignal, signals};
use monitor::Usage;

/// Default search path inside the sandbox.
pub const DEFAULT_SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// How long to wait for output readers after the process is gone.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Stderr fragments emitted by common runtimes when an allocation fails.
const MEMORY_MARKERS: &[&str] = &[
    "MemoryError",
    "bad_alloc",
    "memory exhausted",
    "Cannot allocate memory",
    "out of memory",
    "OutOfMemoryError",
    "failed to allocate",
];

/// Stderr fragments emitted when a write hits `RLIMIT_FSIZE` with SIGXFSZ ignored.
const FILE_SIZE_MARKERS: &[&str] = &["File too large"];

/// Stderr fragments emitted when `fork` hits `RLIMIT_NPROC`.
const PROCESS_MARKERS: &[&str] = &["Resource temporarily unavailable"];

/// Supervisor settings shared by every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Time between `SIGTERM` and `SIGKILL`.
    #[serde(with = "serde_duration")]
    pub grace_period: Duration,
    /// Per-stream capture cap.
    pub output_limit_bytes: usize,
    /// Monitor sampling interval.
    #[serde(with = "serde_duration")]
    pub poll_interval: Duration,
    /// `PATH` given to the child.
    pub path: String,
    /// Parent directory for workspaces (system temp dir if unset).
    pub workspace_root: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(2),
            output_limit_bytes: 1024 * 1024,
            poll_interval: Duration::from_millis(100),
            path: DEFAULT_SANDBOX_PATH.to_string(),
            workspace_root: None,
        }
    }
}

/// What to run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SandboxRequest {
    /// Program and arguments. `argv[0]` is resolved against the sandbox `PATH`.
    pub argv: Vec<String>,
    /// Data written to the child's stdin, which is then closed.
    pub stdin: Option<String>,
    /// Host files to copy into the workspace (checked against `allowed_paths`).
    pub inputs: Vec<PathBuf>,
    /// Extra environment variables. `LD_*` names are dropped.
    pub env: Vec<(String, String)>,
}

impl SandboxRequest {
    /// Request for `argv` with no stdin.
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Builder: set stdin.
    pub fn with_stdin(mut self, stdin: Option<String>) -> Self {
        self.stdin = stdin;
        self
    }

    /// Builder: stage host files.
    pub fn with_inputs(mut self, inputs: Vec<PathBuf>) -> Self {
        self.inputs = inputs;
        self
    }

    /// Builder: add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Result of a process that ran to exit within its limits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SandboxOutput {
    pub exit_code: Option<i32>,
    /// Terminating signal, if any.
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    /// Highest resident set observed by the monitor.
    pub peak_memory_kb: Option<u64>,
    /// Last CPU time observed by the monitor.
    pub cpu_time: Option<Duration>,
    /// Whether either stream hit the capture cap.
    pub truncated: bool,
}

impl SandboxOutput {
    /// Exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Errors from a sandboxed run.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Wall-clock deadline exceeded; the process group was killed.
    #[error("Timeout: exceeded wall-clock limit of {limit:?}")]
    Timeout {
        limit: Duration,
        output: Box<SandboxOutput>,
    },

    /// A resource limit was exceeded.
    #[error("ResourceExceeded: {kind} limit exceeded")]
    ResourceExceeded {
        kind: ResourceKind,
        output: Box<SandboxOutput>,
    },

    /// Cancellation was requested; the process group was killed.
    #[error("Cancelled")]
    Cancelled { output: Box<SandboxOutput> },

    /// The program could not be started.
    #[error("SpawnFailed: {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The request was malformed or not permitted.
    #[error("invalid sandbox request: {0}")]
    InvalidRequest(String),

    /// Workspace could not be prepared.
    #[error("workspace error: {0}")]
    Workspace(#[source] io::Error),

    /// Waiting on the child failed.
    #[error("failed to wait for sandboxed process: {0}")]
    Wait(#[source] io::Error),
}

impl SandboxError {
    /// Output captured before the process was stopped, if it ran.
    pub fn output(&self) -> Option<&SandboxOutput> {
        match self {
            SandboxError::Timeout { output, .. }
            | SandboxError::ResourceExceeded { output, .. }
            | SandboxError::Cancelled { output } => Some(output),
            _ => None,
        }
    }

    /// Classification recorded on the task result.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            SandboxError::Timeout { .. } => FailureKind::Timeout,
            SandboxError::ResourceExceeded { kind, .. } => FailureKind::ResourceExceeded(*kind),
            SandboxError::Cancelled { .. } => FailureKind::Cancelled,
            SandboxError::SpawnFailed { .. } | SandboxError::Wait(_) => FailureKind::SpawnFailed,
            SandboxError::InvalidRequest(_) => FailureKind::InvalidRequest,
            SandboxError::Workspace(_) => FailureKind::SpawnFailed,
        }
    }
}

/// Why supervision ended early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Violation {
    Timeout,
    Resource(ResourceKind),
    Cancelled,
}

enum Ending {
    Exited(io::Result<ExitStatus>),
    Violated(Violation),
}

/// Spawns and supervises sandboxed processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessSandbox {
    config: SandboxConfig,
}

impl ProcessSandbox {
    /// Sandbox with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sandbox with explicit settings.
    pub fn with_config(config: SandboxConfig) -> Self {
        Self { config }
    }

    /// Current settings.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Create a fresh workspace for a multi-step run.
    pub fn workspace(&self) -> Result<Workspace, SandboxError> {
        Workspace::create(self.config.workspace_root.as_deref())
    }

    /// Run `request` in a fresh workspace that is removed afterwards.
    ///
    /// The effective deadline is the earlier of `deadline` and
    /// `policy.wall_seconds` from now.
    pub async fn execute(
        &self,
        request: SandboxRequest,
        policy: &SandboxPolicy,
        deadline: Option<Instant>,
        cancel: &CancelToken,
    ) -> Result<SandboxOutput, SandboxError> {
        let workspace = self.workspace()?;
        self.execute_in(&workspace, request, policy, deadline, cancel)
            .await
    }

    /// Run `request` inside an existing workspace.
    pub async fn execute_in(
        &self,
        workspace: &Workspace,
        request: SandboxRequest,
        policy: &SandboxPolicy,
        deadline: Option<Instant>,
        cancel: &CancelToken,
    ) -> Result<SandboxOutput, SandboxError> {
        let program = match request.argv.first() {
            Some(program) if !program.is_empty() => program.clone(),
            _ => return Err(SandboxError::InvalidRequest("empty argv".to_string())),
        };
        policy.validate().map_err(SandboxError::InvalidRequest)?;
        if cancel.is_cancelled() {
            return Err(SandboxError::Cancelled {
                output: Box::default(),
            });
        }
        for input in &request.inputs {
            workspace.stage_input(input, &policy.allowed_paths)?;
        }

        let started = Instant::now();
        let wall = policy.wall_time();
        let wall_deadline = deadline_after(started, wall);
        let (deadline_at, limit) = match deadline {
            Some(d) if d < wall_deadline => (d, d.saturating_duration_since(started)),
            _ => (wall_deadline, wall),
        };

        let mut cmd = self.command(workspace, &request, policy);
        let mut child = cmd.spawn().map_err(|source| SandboxError::SpawnFailed {
            program: program.clone(),
            source,
        })?;
        let pid = child.id();
        tracing::debug!(pid = ?pid, program = %program, "sandboxed process started");

        let stdin_task = match (child.stdin.take(), request.stdin) {
            (Some(mut pipe), Some(data)) => Some(tokio::spawn(async move {
                // A child that exits without reading stdin closes the pipe; ignore EPIPE.
                let _ = pipe.write_all(data.as_bytes()).await;
                let _ = pipe.shutdown().await;
            })),
            _ => None,
        };
        let limit_bytes = self.config.output_limit_bytes;
        let stdout_task = tokio::spawn(capture::capture(child.stdout.take(), limit_bytes));
        let stderr_task = tokio::spawn(capture::capture(child.stderr.take(), limit_bytes));

        let mut usage = Usage::default();
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let watchdog = tokio::time::sleep_until(deadline_at);
        tokio::pin!(watchdog);

        let ending = loop {
            tokio::select! {
                status = child.wait() => break Ending::Exited(status),
                _ = &mut watchdog => break Ending::Violated(Violation::Timeout),
                _ = cancel.cancelled() => break Ending::Violated(Violation::Cancelled),
                _ = ticker.tick() => {
                    if let Some(sample) = pid.and_then(monitor::sample) {
                        usage.observe(sample);
                        if let Some(kind) = usage.exceeded(policy) {
                            break Ending::Violated(Violation::Resource(kind));
                        }
                    }
                }
            }
        };

        let (status, violation) = match ending {
            Ending::Exited(status) => (status.map_err(SandboxError::Wait)?, None),
            Ending::Violated(violation) => {
                tracing::info!(pid = ?pid, program = %program, violation = ?violation, "stopping sandboxed process");
                (self.terminate(&mut child, pid).await?, Some(violation))
            }
        };
        // Descendants that outlived the leader are not allowed to linger.
        if let Some(pid) = pid {
            limits::signal_group(pid, GroupSignal::Kill);
        }
        if let Some(task) = stdin_task {
            task.abort();
        }
        let stdout = drain(stdout_task).await;
        let stderr = drain(stderr_task).await;

        let output = SandboxOutput {
            exit_code: status.code(),
            signal: exit_signal(&status),
            truncated: stdout.truncated || stderr.truncated,
            stdout: stdout.into_string(),
            stderr: stderr.into_string(),
            duration: started.elapsed(),
            peak_memory_kb: usage.peak_rss_kb,
            cpu_time: usage.cpu,
        };
        tracing::debug!(
            program = %program,
            exit_code = ?output.exit_code,
            signal = ?output.signal,
            duration_ms = output.duration.as_millis() as u64,
            "sandboxed process finished"
        );

        let output = Box::new(output);
        match violation {
            Some(Violation::Timeout) => Err(SandboxError::Timeout { limit, output }),
            Some(Violation::Cancelled) => Err(SandboxError::Cancelled { output }),
            Some(Violation::Resource(kind)) => Err(SandboxError::ResourceExceeded { kind, output }),
            None => match classify_exit(&output, policy) {
                Some(kind) => Err(SandboxError::ResourceExceeded { kind, output }),
                None => Ok(*output),
            },
        }
    }

    fn command(
        &self,
        workspace: &Workspace,
        request: &SandboxRequest,
        policy: &SandboxPolicy,
    ) -> Command {
        let ws = workspace.path();
        let mut cmd = Command::new(&request.argv[0]);
        cmd.args(&request.argv[1..])
            .current_dir(ws)
            .env_clear()
            .env("PATH", &self.config.path)
            .env("HOME", ws)
            .env("TMPDIR", ws)
            .env("TMP", ws)
            .env("TEMP", ws)
            .env("LANG", "C.UTF-8")
            .stdin(if request.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &request.env {
            if key.starts_with("LD_") {
                tracing::warn!(variable = %key, "dropping loader variable from sandbox environment");
                continue;
            }
            cmd.env(key, value);
        }
        limits::install(&mut cmd, policy);
        cmd
    }

    /// SIGTERM the group, wait out the grace period, then SIGKILL and reap.
    async fn terminate(&self, child: &mut Child, pid: Option<u32>) -> Result<ExitStatus, SandboxError> {
        let signalled = pid.is_some_and(|pid| limits::signal_group(pid, GroupSignal::Terminate));
        if !signalled {
            let _ = child.start_kill();
        }
        if let Ok(status) = tokio::time::timeout(self.config.grace_period, child.wait()).await {
            return status.map_err(SandboxError::Wait);
        }
        tracing::warn!(pid = ?pid, "process ignored SIGTERM, sending SIGKILL");
        if let Some(pid) = pid {
            limits::signal_group(pid, GroupSignal::Kill);
        }
        let _ = child.start_kill();
        child.wait().await.map_err(SandboxError::Wait)
    }
}

async fn drain(mut task: JoinHandle<Captured>) -> Captured {
    match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut task).await {
        Ok(Ok(captured)) => captured,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "output reader failed");
            Captured::default()
        }
        Err(_) => {
            task.abort();
            Captured::default()
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// Attribute an abnormal exit to a resource limit the kernel enforced.
fn classify_exit(output: &SandboxOutput, policy: &SandboxPolicy) -> Option<ResourceKind> {
    match output.signal {
        Some(signals::SIGXCPU) => return Some(ResourceKind::Cpu),
        Some(signals::SIGXFSZ) => return Some(ResourceKind::FileSize),
        Some(signals::SIGKILL)
            if output
                .cpu_time
                .is_some_and(|cpu| cpu >= Duration::from_secs(policy.cpu_seconds)) =>
        {
            return Some(ResourceKind::Cpu);
        }
        _ => {}
    }
    if output.success() {
        return None;
    }
    let stderr = output.stderr.as_str();
    if MEMORY_MARKERS.iter().any(|m| stderr.contains(m)) {
        return Some(ResourceKind::Memory);
    }
    if FILE_SIZE_MARKERS.iter().any(|m| stderr.contains(m)) {
        return Some(ResourceKind::FileSize);
    }
    if PROCESS_MARKERS.iter().any(|m| stderr.contains(m)) {
        return Some(ResourceKind::Processes);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cancel::cancel_pair;

    fn policy() -> SandboxPolicy {
        SandboxPolicy::default()
            .with_memory_mb(256)
            .with_max_processes(1024)
            .with_wall_time(Duration::from_secs(10))
    }

    #[test]
    fn test_classify_memory_marker() {
        let output = SandboxOutput {
            exit_code: Some(1),
            stderr: "Traceback ...\nMemoryError\n".to_string(),
            ..SandboxOutput::default()
        };
        assert_eq!(classify_exit(&output, &policy()), Some(ResourceKind::Memory));
    }

    #[test]
    fn test_classify_clean_exit_ignores_markers() {
        let output = SandboxOutput {
            exit_code: Some(0),
            stderr: "warning: out of memory in cache, retrying".to_string(),
            ..SandboxOutput::default()
        };
        assert_eq!(classify_exit(&output, &policy()), None);
    }

    #[test]
    fn test_classify_sigxcpu() {
        let output = SandboxOutput {
            signal: Some(signals::SIGXCPU),
            ..SandboxOutput::default()
        };
        assert_eq!(classify_exit(&output, &policy()), Some(ResourceKind::Cpu));
    }

    #[test]
    fn test_error_keeps_partial_output() {
        let err = SandboxError::Timeout {
            limit: Duration::from_secs(1),
            output: Box::new(SandboxOutput {
                stdout: "partial".to_string(),
                ..SandboxOutput::default()
            }),
        };
        assert_eq!(err.output().unwrap().stdout, "partial");
        assert_eq!(err.failure_kind(), FailureKind::Timeout);
        assert!(err.to_string().starts_with("Timeout"));
    }

    #[tokio::test]
    async fn test_empty_argv_rejected() {
        let sandbox = ProcessSandbox::new();
        let err = sandbox
            .execute(SandboxRequest::default(), &policy(), None, &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::InvalidRequest(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_echo_captures_stdout() {
        let sandbox = ProcessSandbox::new();
        let output = sandbox
            .execute(
                SandboxRequest::new(["echo", "hello"]),
                &policy(),
                None,
                &CancelToken::never(),
            )
            .await
            .unwrap();

        assert!(output.success());
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_output_not_error() {
        let sandbox = ProcessSandbox::new();
        let output = sandbox
            .execute(
                SandboxRequest::new(["sh", "-c", "echo oops >&2; exit 3"]),
                &policy(),
                None,
                &CancelToken::never(),
            )
            .await
            .unwrap();

        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stderr.trim(), "oops");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdin_is_delivered() {
        let sandbox = ProcessSandbox::new();
        let output = sandbox
            .execute(
                SandboxRequest::new(["cat"]).with_stdin(Some("piped input".to_string())),
                &policy(),
                None,
                &CancelToken::never(),
            )
            .await
            .unwrap();

        assert_eq!(output.stdout, "piped input");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_environment_is_scrubbed() {
        let sandbox = ProcessSandbox::new();
        let output = sandbox
            .execute(
                SandboxRequest::new(["sh", "-c", "echo \"$HOME|$PATH|${LD_PRELOAD:-none}|$EXTRA\""])
                    .with_env("LD_PRELOAD", "/tmp/evil.so")
                    .with_env("EXTRA", "yes"),
                &policy(),
                None,
                &CancelToken::never(),
            )
            .await
            .unwrap();

        let fields: Vec<&str> = output.stdout.trim().split('|').collect();
        assert!(fields[0].contains("corral-run-"));
        assert_eq!(fields[1], DEFAULT_SANDBOX_PATH);
        assert_eq!(fields[2], "none");
        assert_eq!(fields[3], "yes");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wall_clock_timeout_kills_process() {
        let sandbox = ProcessSandbox::new();
        let policy = policy().with_wall_time(Duration::from_millis(300));
        let started = std::time::Instant::now();

        let err = sandbox
            .execute(
                SandboxRequest::new(["sleep", "5"]),
                &policy,
                None,
                &CancelToken::never(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, SandboxError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_preserves_partial_output() {
        let sandbox = ProcessSandbox::new();
        let policy = policy().with_wall_time(Duration::from_millis(500));

        let err = sandbox
            .execute(
                SandboxRequest::new(["sh", "-c", "echo started; sleep 5"]),
                &policy,
                None,
                &CancelToken::never(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.output().unwrap().stdout.trim(), "started");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_explicit_deadline_wins_when_earlier() {
        let sandbox = ProcessSandbox::new();
        let deadline = Instant::now() + Duration::from_millis(200);

        let err = sandbox
            .execute(
                SandboxRequest::new(["sleep", "5"]),
                &policy(),
                Some(deadline),
                &CancelToken::never(),
            )
            .await
            .unwrap_err();

        match err {
            SandboxError::Timeout { limit, .. } => assert!(limit <= Duration::from_millis(200)),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancellation_stops_process() {
        let sandbox = ProcessSandbox::new();
        let (handle, token) = cancel_pair();
        let started = std::time::Instant::now();

        let run = tokio::spawn(async move {
            sandbox
                .execute(SandboxRequest::new(["sleep", "5"]), &policy(), None, &token)
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel();

        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(err, SandboxError::Cancelled { .. }));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_program_is_spawn_failure() {
        let sandbox = ProcessSandbox::new();
        let err = sandbox
            .execute(
                SandboxRequest::new(["definitely-not-a-real-program-xyz"]),
                &policy(),
                None,
                &CancelToken::never(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, SandboxError::SpawnFailed { .. }));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_file_size_limit() {
        let sandbox = ProcessSandbox::new();
        let mut policy = policy();
        policy.max_file_size_mb = 1;

        let err = sandbox
            .execute(
                SandboxRequest::new(["sh", "-c", "exec head -c 3000000 /dev/zero > big.bin"]),
                &policy,
                None,
                &CancelToken::never(),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SandboxError::ResourceExceeded {
                kind: ResourceKind::FileSize,
                ..
            }
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_workspace_removed_after_run() {
        let sandbox = ProcessSandbox::new();
        let output = sandbox
            .execute(
                SandboxRequest::new(["pwd"]),
                &policy(),
                None,
                &CancelToken::never(),
            )
            .await
            .unwrap();

        let dir = std::path::PathBuf::from(output.stdout.trim());
        assert!(!dir.exists());
    }

    /// Whether `pid` has exited (gone, or a zombie awaiting its reaper).
    #[cfg(target_os = "linux")]
    fn exited(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rfind(')')
                .and_then(|end| stat[end + 1..].trim_start().chars().next())
                .is_some_and(|state| matches!(state, 'Z' | 'X')),
            Err(_) => true,
        }
    }

    #[cfg(target_os = "linux")]
    async fn wait_exited(pid: u32) -> bool {
        for _ in 0..100 {
            if exited(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_sigterm_ignored_escalates_to_sigkill() {
        let sandbox = ProcessSandbox::with_config(SandboxConfig {
            grace_period: Duration::from_millis(500),
            ..SandboxConfig::default()
        });
        let policy = policy().with_wall_time(Duration::from_millis(300));
        let started = std::time::Instant::now();

        let err = sandbox
            .execute(
                SandboxRequest::new([
                    "sh",
                    "-c",
                    "trap '' TERM; (trap '' TERM; sleep 30) & echo $!; sleep 30",
                ]),
                &policy,
                None,
                &CancelToken::never(),
            )
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, SandboxError::Timeout { .. }));
        // Wall limit plus the full grace period, since SIGTERM is ignored.
        assert!(elapsed >= Duration::from_millis(700), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(800) + Duration::from_secs(2), "{elapsed:?}");

        let background: u32 = err.output().unwrap().stdout.trim().parse().unwrap();
        assert!(wait_exited(background).await);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_descendants_killed_after_leader_exits() {
        let sandbox = ProcessSandbox::new();

        let output = sandbox
            .execute(
                SandboxRequest::new(["sh", "-c", "sleep 30 & echo $!"]),
                &policy(),
                None,
                &CancelToken::never(),
            )
            .await
            .unwrap();

        assert!(output.success());
        assert!(output.duration < Duration::from_secs(5));
        let background: u32 = output.stdout.trim().parse().unwrap();
        assert!(wait_exited(background).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unbounded_deadline_still_runs() {
        let sandbox = ProcessSandbox::new();
        let deadline = deadline_after(Instant::now(), Duration::MAX);

        let output = sandbox
            .execute(
                SandboxRequest::new(["echo", "hi"]),
                &policy(),
                Some(deadline),
                &CancelToken::never(),
            )
            .await
            .unwrap();

        assert_eq!(output.stdout, "hi\n");
    }
}
