//! corral - sandboxed code execution and task scheduling.
//!
//! Usage:
//!   corral run <tasks.yaml>           Run a batch of tasks and print their results
//!   corral exec -- <program> [args]   Run one command in the sandbox
//!   corral code <language> <file>     Compile (if needed) and run a source file
//!   corral languages                  List supported languages and installed toolchains
//!   corral validate <tasks.yaml>      Validate a task file without running it
//!   corral export <dump.json>         Write every stored task and result to a file
//!   corral import <dump.json>         Load tasks and results from an export

use clap::{Parser, Subcommand};
use corral::{
    Engine, EngineConfig, Event, EventHandler, FailureKind, InMemoryStore, Priority, SandboxPolicy,
    StorageConfig, StoreDump, TaskFile, TaskId, TaskResult, TaskSpec, TaskStore, Toolchains,
    YamlLoader, submit_task_file,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// corral - sandboxed code execution and task scheduling
#[derive(Parser)]
#[command(name = "corral")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Engine configuration file (corral.yaml)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Number of workers (overrides the configuration file)
    #[arg(short = 'j', long, global = true)]
    pool_size: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every task in a task file and wait for them to finish
    Run {
        /// Path to the task file
        #[arg(value_name = "TASKS_FILE")]
        tasks_file: PathBuf,
    },

    /// Run a single command inside the sandbox
    Exec {
        #[command(flatten)]
        limits: LimitArgs,

        /// Text passed to the command on stdin
        #[arg(long)]
        stdin: Option<String>,

        /// Program and arguments
        #[arg(required = true, last = true, value_name = "ARGV")]
        argv: Vec<String>,
    },

    /// Run a source file through the execution pipeline
    Code {
        /// Language name or alias (see `corral languages`)
        #[arg(value_name = "LANGUAGE")]
        language: String,

        /// Source file, or `-` for stdin
        #[arg(value_name = "FILE")]
        file: PathBuf,

        #[command(flatten)]
        limits: LimitArgs,

        /// Text passed to the program on stdin
        #[arg(long)]
        stdin: Option<String>,
    },

    /// List supported languages and whether their toolchains are installed
    Languages,

    /// Validate a task file without running it
    Validate {
        /// Path to the task file
        #[arg(value_name = "TASKS_FILE")]
        tasks_file: PathBuf,
    },

    /// Write every task and result in the configured store to a JSON file
    Export {
        /// Output file, or `-` for stdout
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Load tasks and results from an export into the configured store
    Import {
        /// File written by `corral export`
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

/// Sandbox limits for one-off runs.
#[derive(clap::Args)]
struct LimitArgs {
    /// Memory ceiling in megabytes
    #[arg(long)]
    memory_mb: Option<u64>,

    /// Wall-clock limit in seconds
    #[arg(long)]
    wall_seconds: Option<f64>,

    /// CPU time limit in seconds
    #[arg(long)]
    cpu_seconds: Option<u64>,

    /// Maximum processes
    #[arg(long)]
    max_processes: Option<u64>,

    /// Dispatch priority
    #[arg(long, default_value = "normal")]
    priority: Priority,
}

impl LimitArgs {
    fn apply(&self, base: &SandboxPolicy, spec: TaskSpec) -> TaskSpec {
        let mut policy = base.clone();
        if let Some(memory_mb) = self.memory_mb {
            policy = policy.with_memory_mb(memory_mb);
        }
        if let Some(seconds) = self.wall_seconds {
            policy.wall_seconds = seconds;
        }
        if let Some(seconds) = self.cpu_seconds {
            policy = policy.with_cpu_seconds(seconds);
        }
        if let Some(max) = self.max_processes {
            policy = policy.with_max_processes(max);
        }

        let mut spec = spec.with_priority(self.priority).with_policy(policy.clone());
        if self.wall_seconds.is_some() {
            spec = spec.with_timeout(policy.wall_time());
        }
        spec
    }
}

/// Simple logging event handler that prints task events.
struct LoggingHandler;

#[async_trait::async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: &Event) {
        match event {
            Event::TaskStarted {
                task_id, attempt, ..
            } => {
                if *attempt == 0 {
                    info!("Task '{}' started", task_id);
                } else {
                    info!("Task '{}' started (retry {})", task_id, attempt);
                }
            }
            Event::TaskCompleted {
                task_id,
                duration,
                exit_code,
                ..
            } => {
                let exit_info = exit_code
                    .map(|c| format!(" (exit: {})", c))
                    .unwrap_or_default();
                info!("Task '{}' completed in {:?}{}", task_id, duration, exit_info);
            }
            Event::TaskFailed {
                task_id, error, ..
            } => {
                warn!("Task '{}' failed: {}", task_id, error);
            }
            Event::TaskRetrying {
                task_id,
                attempt,
                max_attempts,
                delay,
                ..
            } => {
                info!(
                    "Task '{}' will retry ({}/{}) in {:?}",
                    task_id, attempt, max_attempts, delay
                );
            }
            Event::TaskCancelled { task_id, .. } => {
                warn!("Task '{}' cancelled", task_id);
            }
            Event::TaskRecovered {
                task_id, reason, ..
            } => {
                warn!("Task '{}' requeued: {}", task_id, reason);
            }
            _ => {}
        }
    }
}

/// Store-level dump or load.
enum Transfer {
    Export(PathBuf),
    Import(PathBuf),
}

/// Work handed to an engine by a subcommand.
enum Work {
    Batch(TaskFile),
    Single(TaskSpec),
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(pool_size) = cli.pool_size {
        config.pool_size = pool_size;
    }

    let all_succeeded = match cli.command {
        Commands::Run { tasks_file } => {
            info!("Loading tasks from: {}", tasks_file.display());
            let file = YamlLoader::load_task_file(&tasks_file)?;
            info!("Loaded {} task(s)", file.tasks.len());
            run(config, Work::Batch(file)).await?
        }
        Commands::Exec {
            limits,
            stdin,
            argv,
        } => {
            let mut spec = TaskSpec::command(argv);
            if let Some(input) = stdin {
                spec = spec.with_stdin(input);
            }
            let spec = limits.apply(&config.default_policy, spec);
            run(config, Work::Single(spec)).await?
        }
        Commands::Code {
            language,
            file,
            limits,
            stdin,
        } => {
            let source = read_source(&file)?;
            let mut spec = TaskSpec::script(language, source);
            if let Some(input) = stdin {
                spec = spec.with_stdin(input);
            }
            let spec = limits.apply(&config.default_policy, spec);
            run(config, Work::Single(spec)).await?
        }
        Commands::Languages => {
            list_languages();
            true
        }
        Commands::Validate { tasks_file } => {
            validate_tasks(&tasks_file)?;
            true
        }
        Commands::Export { file } => {
            transfer(config.storage, Transfer::Export(file)).await?;
            true
        }
        Commands::Import { file } => {
            transfer(config.storage, Transfer::Import(file)).await?;
            true
        }
    };

    if !all_succeeded {
        std::process::exit(1);
    }
    Ok(())
}

/// Load engine settings from `path`, or `./corral.yaml` when present.
fn load_config(path: Option<&Path>) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(YamlLoader::load_engine_config(path)?),
        None if Path::new("corral.yaml").is_file() => {
            Ok(YamlLoader::load_engine_config("corral.yaml")?)
        }
        None => Ok(EngineConfig::default()),
    }
}

fn read_source(file: &Path) -> Result<String, Box<dyn std::error::Error>> {
    if file.as_os_str() == "-" {
        let mut source = String::new();
        std::io::Read::read_to_string(&mut std::io::stdin(), &mut source)?;
        Ok(source)
    } else {
        Ok(std::fs::read_to_string(file)?)
    }
}

/// Start an engine on the configured store and run `work` to completion.
async fn run(config: EngineConfig, work: Work) -> Result<bool, Box<dyn std::error::Error>> {
    match config.storage.clone() {
        StorageConfig::Memory => run_with_store(InMemoryStore::new(), config, work).await,
        #[cfg(feature = "sqlite")]
        StorageConfig::Sqlite { path } => {
            info!("Using SQLite storage at {}", path);
            let store = corral::SqliteStore::new(&path).await?;
            run_with_store(store, config, work).await
        }
        #[cfg(not(feature = "sqlite"))]
        StorageConfig::Sqlite { .. } => {
            Err("SQLite storage requires the `sqlite` feature".into())
        }
    }
}

async fn run_with_store<S: TaskStore + 'static>(
    store: S,
    config: EngineConfig,
    work: Work,
) -> Result<bool, Box<dyn std::error::Error>> {
    let engine = Engine::new(store).with_config(config);
    engine.event_bus().register(Arc::new(LoggingHandler)).await;
    let (handle, engine_task) = engine.start().await?;

    let submitted: Vec<(String, TaskId)> = match work {
        Work::Batch(file) => match submit_task_file(&handle, &file).await {
            Ok(submitted) => submitted,
            Err(e) => {
                error!("Failed to submit tasks: {}", e);
                handle.shutdown().await?;
                return Err(e.into());
            }
        },
        Work::Single(spec) => {
            let name = spec.name.clone();
            match handle.submit(spec).await {
                Ok(id) => vec![(name, id)],
                Err(e) => {
                    error!("Failed to submit task: {}", e);
                    handle.shutdown().await?;
                    return Err(e.into());
                }
            }
        }
    };

    let waiting = async {
        let mut all_succeeded = true;
        for (key, id) in &submitted {
            match handle.wait(id.clone()).await {
                Ok(result) => {
                    all_succeeded &= result.is_success();
                    print_result(key, &result);
                }
                Err(e) => {
                    all_succeeded = false;
                    error!("Lost track of task '{}': {}", key, e);
                }
            }
        }
        all_succeeded
    };

    let all_succeeded = tokio::select! {
        all_succeeded = waiting => all_succeeded,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, cancelling tasks...");
            for (_, id) in &submitted {
                let _ = handle.cancel(id.clone()).await;
            }
            false
        }
    };

    handle.shutdown().await?;
    let _ = tokio::time::timeout(Duration::from_secs(5), engine_task).await;
    Ok(all_succeeded)
}

/// Export from or import into the configured store.
async fn transfer(
    storage: StorageConfig,
    op: Transfer,
) -> Result<(), Box<dyn std::error::Error>> {
    match storage {
        StorageConfig::Memory => {
            Err("export and import need a persistent store; configure `storage` in corral.yaml".into())
        }
        #[cfg(feature = "sqlite")]
        StorageConfig::Sqlite { path } => {
            info!("Using SQLite storage at {}", path);
            let store = corral::SqliteStore::new(&path).await?;
            let outcome = transfer_with_store(&store, op).await;
            store.close().await;
            outcome
        }
        #[cfg(not(feature = "sqlite"))]
        StorageConfig::Sqlite { .. } => {
            Err("SQLite storage requires the `sqlite` feature".into())
        }
    }
}

async fn transfer_with_store<S: TaskStore + ?Sized>(
    store: &S,
    op: Transfer,
) -> Result<(), Box<dyn std::error::Error>> {
    match op {
        Transfer::Export(file) => {
            let dump = StoreDump::export(store, chrono::Utc::now()).await?;
            let json = dump.to_json()?;
            if file.as_os_str() == "-" {
                println!("{}", json);
            } else {
                std::fs::write(&file, json)?;
            }
            info!(
                "Exported {} task(s) and {} result(s)",
                dump.tasks.len(),
                dump.results.len()
            );
        }
        Transfer::Import(file) => {
            let dump = StoreDump::from_json(&std::fs::read_to_string(&file)?)?;
            let summary = dump.import_into(store).await?;
            info!(
                "Imported {} task(s) and {} result(s), skipped {} existing record(s)",
                summary.tasks, summary.results, summary.skipped
            );
        }
    }
    Ok(())
}

fn print_result(key: &str, result: &TaskResult) {
    let label = if key.is_empty() {
        result.task_id.to_string()
    } else {
        key.to_string()
    };
    let exit_info = result
        .exit_code
        .map(|c| format!(" exit={}", c))
        .unwrap_or_default();
    println!(
        "[{}] {} ({:?}{})",
        label, result.status, result.duration, exit_info
    );

    if let Some(value) = &result.value {
        println!("  value: {}", value);
    }
    if let Some(error) = &result.error {
        println!("  error: {}", error);
    }
    if result.failure == Some(FailureKind::CompileFailed) {
        if let Some(diagnostics) = &result.diagnostics {
            for line in diagnostics.lines() {
                println!("  compile: {}", line);
            }
        }
    }
    for line in result.stdout.lines() {
        println!("  stdout: {}", line);
    }
    for line in result.stderr.lines() {
        println!("  stderr: {}", line);
    }
}

/// List the language table with toolchain availability.
fn list_languages() {
    let toolchains = Toolchains::discover();
    println!("Supported languages:");
    println!();
    for language in corral::pipeline::LANGUAGES {
        let status = if toolchains.supports(language) {
            "installed"
        } else {
            "missing"
        };
        let kind = if language.is_compiled() {
            "compiled"
        } else {
            "interpreted"
        };
        println!("  {:<12} {:<12} {}", language.name, kind, status);
        if !language.aliases.is_empty() {
            println!("  {:<12} aliases: {}", "", language.aliases.join(", "));
        }
    }
}

/// Validate a task file without running it.
fn validate_tasks(tasks_file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    info!("Validating tasks in: {}", tasks_file.display());

    match YamlLoader::load_task_file(tasks_file) {
        Ok(file) => {
            info!("All {} task(s) are valid:", file.tasks.len());
            for entry in &file.tasks {
                if entry.depends_on.is_empty() {
                    info!("  - {} ({}): OK", entry.key, entry.spec.kind.kind());
                } else {
                    info!(
                        "  - {} ({}, depends on: {}): OK",
                        entry.key,
                        entry.spec.kind.kind(),
                        entry.depends_on.join(", ")
                    );
                }
            }
            Ok(())
        }
        Err(e) => {
            error!("Validation failed: {}", e);
            Err(e.into())
        }
    }
}
