//! Common test utilities shared across integration tests.

use corral::{SandboxPolicy, Task, TaskId, TaskStatus, TaskStore};
use std::time::Duration;

/// Wait for a task to reach an expected status, polling storage.
///
/// This is more reliable than fixed sleeps since execution time can vary.
/// Polls storage every 10ms and times out after the specified duration.
///
/// # Panics
///
/// Panics if the timeout is reached before the task reaches the expected status.
pub async fn wait_for_status(
    storage: &dyn TaskStore,
    id: &TaskId,
    expected: TaskStatus,
    timeout: Duration,
) -> Task {
    let start = tokio::time::Instant::now();
    loop {
        let task = storage.get(id).await.unwrap();
        if task.status == expected {
            return task;
        }
        if start.elapsed() > timeout {
            panic!(
                "Timeout waiting for task {} to reach {:?}, current status: {:?}",
                id, expected, task.status
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Policy roomy enough for shells and interpreters on a busy host.
pub fn roomy_policy() -> SandboxPolicy {
    SandboxPolicy::default()
        .with_memory_mb(256)
        .with_max_processes(1024)
        .with_wall_time(Duration::from_secs(10))
}

/// Whether `program` is on the host `PATH`.
pub fn have_program(program: &str) -> bool {
    std::env::var_os("PATH").is_some_and(|path| {
        std::env::split_paths(&path).any(|dir| dir.join(program).is_file())
    })
}
