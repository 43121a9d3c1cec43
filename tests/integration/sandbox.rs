//! Sandbox limit integration tests.
//!
//! Tests that verify commands and scripts submitted to the engine are held
//! to their sandbox policy and that violations are classified on the result.

use crate::common::{have_program, roomy_policy};
use corral::pipeline::languages;
use corral::{
    Engine, EngineConfig, EngineError, EngineHandle, FailureKind, FunctionRegistry,
    InMemoryStore, ResourceKind, TaskId, TaskResult, TaskSpec, TaskStatus, Toolchains,
    ValidationError,
};
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(30);

async fn start() -> EngineHandle {
    let config = EngineConfig::default()
        .with_pool_size(2)
        .with_tick_interval(Duration::from_millis(20))
        .with_default_policy(roomy_policy());
    let (handle, _task) = Engine::new(InMemoryStore::new())
        .with_config(config)
        .with_registry(FunctionRegistry::new())
        .with_toolchains(Toolchains::discover())
        .start()
        .await
        .unwrap();
    handle
}

async fn wait(handle: &EngineHandle, id: &TaskId) -> TaskResult {
    tokio::time::timeout(WAIT, handle.wait(id.clone()))
        .await
        .expect("task did not finish in time")
        .unwrap()
}

fn toolchain_installed(language: &str) -> bool {
    languages::lookup(language).is_some_and(|spec| Toolchains::discover().supports(spec))
}

/// Test: A command over its wall-clock limit is killed and reported as a timeout.
#[tokio::test]
async fn test_wall_clock_limit() {
    let handle = start().await;

    let started = Instant::now();
    let id = handle
        .submit(
            TaskSpec::command(["sleep", "5"])
                .with_policy(roomy_policy().with_wall_time(Duration::from_secs(1))),
        )
        .await
        .unwrap();
    let result = wait(&handle, &id).await;

    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(result.failure, Some(FailureKind::Timeout));
    assert!(result.error.unwrap().starts_with("Timeout"));
    assert!(started.elapsed() < Duration::from_secs(4));

    handle.shutdown().await.unwrap();
}

/// Test: The task timeout applies when it is shorter than the policy.
#[tokio::test]
async fn test_task_timeout_caps_policy() {
    let handle = start().await;

    let id = handle
        .submit(TaskSpec::command(["sleep", "5"]).with_timeout(Duration::from_millis(500)))
        .await
        .unwrap();
    let result = wait(&handle, &id).await;

    assert_eq!(result.failure, Some(FailureKind::Timeout));
    assert!(result.duration < Duration::from_secs(4));

    handle.shutdown().await.unwrap();
}

/// Test: Output and exit code of a command are recorded.
#[tokio::test]
async fn test_command_output_and_stdin() {
    let handle = start().await;

    let ok = handle
        .submit(TaskSpec::command(["cat"]).with_stdin("from stdin"))
        .await
        .unwrap();
    let bad = handle
        .submit(TaskSpec::command(["sh", "-c", "echo partial; exit 7"]))
        .await
        .unwrap();

    let ok_result = wait(&handle, &ok).await;
    assert!(ok_result.is_success());
    assert_eq!(ok_result.stdout, "from stdin");
    assert_eq!(ok_result.exit_code, Some(0));

    let bad_result = wait(&handle, &bad).await;
    assert_eq!(bad_result.failure, Some(FailureKind::NonZeroExit));
    assert_eq!(bad_result.exit_code, Some(7));
    assert_eq!(bad_result.stdout, "partial\n");

    handle.shutdown().await.unwrap();
}

/// Test: An effectively unlimited timeout does not cut the command short.
#[tokio::test]
async fn test_unbounded_task_timeout() {
    let handle = start().await;

    let id = handle
        .submit(TaskSpec::command(["echo", "hi"]).with_timeout(Duration::MAX))
        .await
        .unwrap();
    let result = wait(&handle, &id).await;

    assert!(result.is_success(), "{:?}", result.error);
    assert_eq!(result.stdout, "hi\n");
    assert_eq!(result.failure, None);

    handle.shutdown().await.unwrap();
}

/// Test: A wall-clock limit that does not fit in a duration is rejected at submit.
#[tokio::test]
async fn test_out_of_range_wall_limit_rejected() {
    let handle = start().await;

    let mut policy = roomy_policy();
    policy.wall_seconds = 1e30;
    let err = handle
        .submit(TaskSpec::command(["echo", "hi"]).with_policy(policy))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        EngineError::Validation(ValidationError::InvalidPolicy(_))
    ));

    handle.shutdown().await.unwrap();
}

/// Test: A missing program fails to spawn.
#[tokio::test]
async fn test_missing_program() {
    let handle = start().await;

    let id = handle
        .submit(TaskSpec::command(["definitely-not-a-real-program-xyz"]))
        .await
        .unwrap();
    let result = wait(&handle, &id).await;

    assert_eq!(result.failure, Some(FailureKind::SpawnFailed));
    assert!(result.error.unwrap().starts_with("SpawnFailed"));

    handle.shutdown().await.unwrap();
}

/// Test: An allocation beyond the memory ceiling is reported as a memory violation.
#[tokio::test]
async fn test_memory_limit() {
    if !have_program("python3") {
        return;
    }
    let handle = start().await;
    let policy = roomy_policy().with_memory_mb(128);

    let over = handle
        .submit(
            TaskSpec::command(["python3", "-c", "x = bytearray(1024 * 1024 * 1024)"])
                .with_policy(policy.clone()),
        )
        .await
        .unwrap();
    let under = handle
        .submit(
            TaskSpec::command([
                "python3",
                "-c",
                "x = bytearray(8 * 1024 * 1024); print(len(x))",
            ])
            .with_policy(policy),
        )
        .await
        .unwrap();

    let over_result = wait(&handle, &over).await;
    assert_eq!(
        over_result.failure,
        Some(FailureKind::ResourceExceeded(ResourceKind::Memory))
    );

    let under_result = wait(&handle, &under).await;
    assert!(under_result.is_success());
    assert_eq!(under_result.stdout.trim(), "8388608");

    handle.shutdown().await.unwrap();
}

/// Test: A shell script runs through the pipeline with stdin.
#[tokio::test]
async fn test_shell_script() {
    if !toolchain_installed("shell") {
        return;
    }
    let handle = start().await;

    let id = handle
        .submit(TaskSpec::script("sh", "read name\necho \"hello $name\"").with_stdin("corral\n"))
        .await
        .unwrap();
    let result = wait(&handle, &id).await;

    assert!(result.is_success());
    assert_eq!(result.stdout.trim(), "hello corral");

    handle.shutdown().await.unwrap();
}

/// Test: A Python script returns its output.
#[tokio::test]
async fn test_python_script() {
    if !toolchain_installed("python") {
        return;
    }
    let handle = start().await;

    let id = handle
        .submit(TaskSpec::script("python", "print(sum(range(10)))"))
        .await
        .unwrap();
    let result = wait(&handle, &id).await;

    assert!(result.is_success());
    assert_eq!(result.stdout.trim(), "45");

    handle.shutdown().await.unwrap();
}

/// Test: A C compile error fails the task with diagnostics and no run.
#[tokio::test]
async fn test_c_compile_failure() {
    if !toolchain_installed("c") {
        return;
    }
    let handle = start().await;

    let broken = handle
        .submit(TaskSpec::script("c", "int main(void) { return missing; }"))
        .await
        .unwrap();
    let working = handle
        .submit(TaskSpec::script(
            "c",
            "#include <stdio.h>\nint main(void) { puts(\"compiled\"); return 0; }\n",
        ))
        .await
        .unwrap();

    let broken_result = wait(&handle, &broken).await;
    assert_eq!(broken_result.failure, Some(FailureKind::CompileFailed));
    assert!(broken_result.diagnostics.is_some());

    let working_result = wait(&handle, &working).await;
    assert!(working_result.is_success());
    assert_eq!(working_result.stdout.trim(), "compiled");

    handle.shutdown().await.unwrap();
}
