//! Compile-and-run pipeline for source code tasks.
//!
//! Interpreted languages run directly inside the [`ProcessSandbox`].
//! Compiled languages first run a sandboxed compile phase with a widened
//! policy; the run phase starts only when the compiler exits with status 0.
//! Source, artifacts, and any files the program writes live in one
//! workspace that is removed when the run ends.

pub mod languages;

pub use languages::{LANGUAGES, LanguageSpec, Toolchains};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::core::cancel::CancelToken;
use crate::core::policy::{MemoryEnforcement, SandboxPolicy};
use crate::core::result::FailureKind;
use crate::sandbox::{ProcessSandbox, SandboxError, SandboxOutput, SandboxRequest, Workspace};

/// Pipeline phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Compile,
    Run,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Compile => write!(f, "compile"),
            Phase::Run => write!(f, "run"),
        }
    }
}

/// Errors from the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Language is not in the table.
    #[error("unknown language: {0}")]
    UnknownLanguage(String),

    /// Language is known but its toolchain was not found at startup.
    #[error("ToolchainUnavailable: {0}")]
    ToolchainUnavailable(String),

    /// A sandboxed phase ended abnormally.
    #[error("{phase} phase failed: {source}")]
    Sandbox {
        phase: Phase,
        #[source]
        source: SandboxError,
    },
}

impl PipelineError {
    /// Classification recorded on the task result.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            PipelineError::UnknownLanguage(_) => FailureKind::InvalidRequest,
            PipelineError::ToolchainUnavailable(_) => FailureKind::ToolchainUnavailable,
            PipelineError::Sandbox { source, .. } => source.failure_kind(),
        }
    }

    /// Output captured before the failing phase was stopped.
    pub fn output(&self) -> Option<&SandboxOutput> {
        match self {
            PipelineError::Sandbox { source, .. } => source.output(),
            _ => None,
        }
    }
}

/// Source code to run.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptRequest {
    pub language: String,
    pub source: String,
    pub stdin: Option<String>,
}

impl ScriptRequest {
    pub fn new(language: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            source: source.into(),
            stdin: None,
        }
    }

    pub fn with_stdin(mut self, stdin: Option<String>) -> Self {
        self.stdin = stdin;
        self
    }
}

/// Result of a pipeline run that reached a normal exit in every phase it ran.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionOutcome {
    /// Canonical language name.
    pub language: String,
    /// Exit code of the last phase that ran.
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Compiler stderr, for compiled languages.
    pub diagnostics: Option<String>,
    /// `Some(false)` if compilation failed and the run phase was skipped.
    pub compiled: Option<bool>,
    /// Where the artifact was built. Removed with the workspace.
    pub artifact: Option<PathBuf>,
    pub compile_duration: Option<Duration>,
    pub run_duration: Option<Duration>,
    pub peak_memory_kb: Option<u64>,
    pub truncated: bool,
}

impl ExecutionOutcome {
    /// Compiled (if needed) and exited with status 0.
    pub fn success(&self) -> bool {
        self.compiled != Some(false) && self.exit_code == Some(0)
    }
}

/// Runs source code through the sandbox.
#[derive(Debug, Clone)]
pub struct ExecutionPipeline {
    sandbox: ProcessSandbox,
    toolchains: Arc<Toolchains>,
}

impl ExecutionPipeline {
    pub fn new(sandbox: ProcessSandbox, toolchains: Toolchains) -> Self {
        Self {
            sandbox,
            toolchains: Arc::new(toolchains),
        }
    }

    pub fn toolchains(&self) -> &Toolchains {
        &self.toolchains
    }

    pub fn sandbox(&self) -> &ProcessSandbox {
        &self.sandbox
    }

    /// Resolve `language` and check its toolchain is installed.
    pub fn check(&self, language: &str) -> Result<&'static LanguageSpec, PipelineError> {
        let spec = languages::lookup(language)
            .ok_or_else(|| PipelineError::UnknownLanguage(language.to_string()))?;
        if !self.toolchains.supports(spec) {
            return Err(PipelineError::ToolchainUnavailable(spec.name.to_string()));
        }
        Ok(spec)
    }

    /// Compile (if needed) and run `script` under `policy`.
    ///
    /// `deadline` bounds both phases together. A compile failure is a normal
    /// outcome with `compiled == Some(false)`; only sandbox violations are
    /// errors.
    pub async fn run(
        &self,
        script: &ScriptRequest,
        policy: &SandboxPolicy,
        deadline: Option<Instant>,
        cancel: &CancelToken,
    ) -> Result<ExecutionOutcome, PipelineError> {
        let spec = self.check(&script.language)?;
        let workspace = self
            .sandbox
            .workspace()
            .map_err(|source| PipelineError::Sandbox {
                phase: Phase::Compile,
                source,
            })?;
        let source_path = workspace
            .write_file(spec.source_file, script.source.as_bytes())
            .map_err(|source| PipelineError::Sandbox {
                phase: Phase::Compile,
                source,
            })?;
        let artifact = workspace.path().join("main.out");

        let mut outcome = ExecutionOutcome {
            language: spec.name.to_string(),
            ..ExecutionOutcome::default()
        };

        if let Some(template) = spec.compile {
            let request = self.request(spec, template, &workspace, &source_path, &artifact, None);
            let compile_policy = policy.for_compile(spec.default_timeout);
            tracing::debug!(language = spec.name, "compiling");
            let compiled = self
                .sandbox
                .execute_in(&workspace, request, &compile_policy, deadline, cancel)
                .await
                .map_err(|source| PipelineError::Sandbox {
                    phase: Phase::Compile,
                    source,
                })?;

            outcome.compile_duration = Some(compiled.duration);
            outcome.diagnostics = Some(compiled.stderr.clone()).filter(|d| !d.is_empty());
            if !compiled.success() {
                tracing::debug!(language = spec.name, exit_code = ?compiled.exit_code, "compilation failed");
                outcome.compiled = Some(false);
                outcome.exit_code = compiled.exit_code;
                outcome.signal = compiled.signal;
                outcome.stdout = compiled.stdout;
                outcome.stderr = compiled.stderr;
                outcome.truncated = compiled.truncated;
                return Ok(outcome);
            }
            outcome.compiled = Some(true);
            if spec.run.contains(&languages::ARTIFACT) {
                outcome.artifact = Some(artifact.clone());
            }
        }

        let request = self.request(
            spec,
            spec.run,
            &workspace,
            &source_path,
            &artifact,
            script.stdin.clone(),
        );
        let run_policy = run_policy(spec, policy);
        let ran = self
            .sandbox
            .execute_in(&workspace, request, &run_policy, deadline, cancel)
            .await
            .map_err(|source| PipelineError::Sandbox {
                phase: Phase::Run,
                source,
            })?;

        outcome.exit_code = ran.exit_code;
        outcome.signal = ran.signal;
        outcome.run_duration = Some(ran.duration);
        outcome.peak_memory_kb = ran.peak_memory_kb;
        outcome.truncated = ran.truncated;
        outcome.stdout = ran.stdout;
        outcome.stderr = ran.stderr;
        Ok(outcome)
    }

    fn request(
        &self,
        spec: &LanguageSpec,
        template: &[&str],
        workspace: &Workspace,
        source: &Path,
        artifact: &Path,
        stdin: Option<String>,
    ) -> SandboxRequest {
        let mut argv: Vec<String> = template
            .iter()
            .map(|part| match *part {
                languages::SOURCE => source.display().to_string(),
                languages::ARTIFACT => artifact.display().to_string(),
                languages::WORKSPACE => workspace.path().display().to_string(),
                other => other.to_string(),
            })
            .collect();
        if let Some(resolved) = argv.first().and_then(|p| self.toolchains.program(p)) {
            argv[0] = resolved.display().to_string();
        }

        let mut request = SandboxRequest::new(argv).with_stdin(stdin);
        for name in spec.passthrough_env {
            if let Ok(value) = std::env::var(name) {
                request = request.with_env(*name, value);
            }
        }
        for (name, value) in spec.env {
            request = request.with_env(*name, *value);
        }
        request
    }
}

/// Task policy adjusted for the language runtime.
fn run_policy(spec: &LanguageSpec, policy: &SandboxPolicy) -> SandboxPolicy {
    let mut adjusted = policy.clone();
    adjusted.max_processes = adjusted.max_processes.max(spec.min_processes);
    if spec.memory == MemoryEnforcement::Resident {
        adjusted.memory_enforcement = MemoryEnforcement::Resident;
    }
    adjusted
}
