//! Pre-exec resource limits and process-group signalling.
//!
//! Limits are installed in the forked child between `fork` and `exec`, so the
//! target program never runs without them. The child also calls `setsid` to
//! lead a new process group, which lets the supervisor signal every
//! descendant at once.

use tokio::process::Command;

use crate::core::policy::SandboxPolicy;

#[cfg(unix)]
use nix::sys::resource::Resource;

/// One rlimit to apply in the child.
#[cfg(unix)]
#[derive(Debug, Clone, Copy)]
struct Limit {
    resource: Resource,
    soft: u64,
    hard: u64,
}

/// Rlimits derived from a policy.
#[cfg(unix)]
fn limits_for(policy: &SandboxPolicy) -> Vec<Limit> {
    let mut limits = vec![
        Limit {
            resource: Resource::RLIMIT_CPU,
            soft: policy.cpu_seconds,
            hard: policy.cpu_seconds.saturating_add(1),
        },
        Limit {
            resource: Resource::RLIMIT_FSIZE,
            soft: policy.file_size_bytes(),
            hard: policy.file_size_bytes(),
        },
        Limit {
            resource: Resource::RLIMIT_NOFILE,
            soft: policy.max_open_files,
            hard: policy.max_open_files,
        },
        Limit {
            resource: Resource::RLIMIT_CORE,
            soft: 0,
            hard: 0,
        },
    ];

    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        limits.push(Limit {
            resource: Resource::RLIMIT_NPROC,
            soft: policy.max_processes,
            hard: policy.max_processes,
        });
        if policy.memory_enforcement == crate::core::policy::MemoryEnforcement::AddressSpace {
            limits.push(Limit {
                resource: Resource::RLIMIT_AS,
                soft: policy.memory_bytes(),
                hard: policy.memory_bytes(),
            });
        }
    }

    limits
}

/// Install the pre-exec hook on `cmd`.
#[cfg(unix)]
pub(crate) fn install(cmd: &mut Command, policy: &SandboxPolicy) {
    use nix::sys::resource::{getrlimit, setrlimit};

    let limits = limits_for(policy);
    // SAFETY: the closure only issues setsid/getrlimit/setrlimit syscalls and
    // does not allocate; `limits` is moved in and iterated by reference.
    unsafe {
        cmd.pre_exec(move || {
            nix::unistd::setsid().map_err(std::io::Error::from)?;
            for limit in &limits {
                let (_, current_hard) =
                    getrlimit(limit.resource).map_err(std::io::Error::from)?;
                let hard = limit.hard.min(current_hard);
                let soft = limit.soft.min(hard);
                setrlimit(limit.resource, soft, hard).map_err(std::io::Error::from)?;
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
pub(crate) fn install(_cmd: &mut Command, _policy: &SandboxPolicy) {
    tracing::warn!("resource limits are not enforced on this platform; only the wall-clock watchdog applies");
}

/// Signals sent to the sandboxed process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GroupSignal {
    Terminate,
    Kill,
}

/// Signal every process in the group led by `pid`.
///
/// Returns false if the group no longer exists.
#[cfg(unix)]
pub(crate) fn signal_group(pid: u32, signal: GroupSignal) -> bool {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    let sig = match signal {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    match killpg(Pid::from_raw(raw), sig) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(e) => {
            tracing::warn!(pid, signal = ?sig, error = %e, "failed to signal process group");
            false
        }
    }
}

#[cfg(not(unix))]
pub(crate) fn signal_group(_pid: u32, _signal: GroupSignal) -> bool {
    false
}

/// Signal numbers that indicate a limit was hit.
#[cfg(unix)]
pub(crate) mod signals {
    pub const SIGKILL: i32 = libc::SIGKILL;
    pub const SIGXCPU: i32 = libc::SIGXCPU;
    pub const SIGXFSZ: i32 = libc::SIGXFSZ;
}

#[cfg(not(unix))]
pub(crate) mod signals {
    pub const SIGKILL: i32 = 9;
    pub const SIGXCPU: i32 = 24;
    pub const SIGXFSZ: i32 = 25;
}
