//! Out-of-process resource sampling.
//!
//! Reads the child's resident set size and CPU time from `/proc`. On
//! platforms without procfs, sampling returns `None` and enforcement falls
//! back to rlimits and the wall-clock watchdog.

use std::time::Duration;

use crate::core::policy::SandboxPolicy;
use crate::core::result::ResourceKind;

/// One observation of a running process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Sample {
    pub rss_kb: u64,
    pub cpu: Duration,
}

/// Running maxima over a process's lifetime.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Usage {
    pub peak_rss_kb: Option<u64>,
    pub cpu: Option<Duration>,
}

impl Usage {
    pub fn observe(&mut self, sample: Sample) {
        self.peak_rss_kb = Some(self.peak_rss_kb.unwrap_or(0).max(sample.rss_kb));
        self.cpu = Some(self.cpu.unwrap_or_default().max(sample.cpu));
    }

    /// Limit the observed usage has crossed, if any.
    ///
    /// CPU gets a one second allowance over the rlimit so that the kernel's
    /// SIGXCPU normally fires first.
    pub fn exceeded(&self, policy: &SandboxPolicy) -> Option<ResourceKind> {
        if let Some(rss) = self.peak_rss_kb {
            if rss.saturating_mul(1024) > policy.memory_bytes() {
                return Some(ResourceKind::Memory);
            }
        }
        if let Some(cpu) = self.cpu {
            if cpu > Duration::from_secs(policy.cpu_seconds.saturating_add(1)) {
                return Some(ResourceKind::Cpu);
            }
        }
        None
    }
}

/// Sample `pid` from procfs.
#[cfg(target_os = "linux")]
pub(crate) fn sample(pid: u32) -> Option<Sample> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    Some(Sample {
        rss_kb: parse_vm_rss(&status)?,
        cpu: parse_cpu_time(&stat, clock_ticks())?,
    })
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn sample(_pid: u32) -> Option<Sample> {
    None
}

#[cfg(target_os = "linux")]
fn clock_ticks() -> u64 {
    // SAFETY: sysconf has no preconditions.
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 { ticks as u64 } else { 100 }
}

/// `VmRSS:    1234 kB` from /proc/<pid>/status.
fn parse_vm_rss(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
}

/// utime + stime (fields 14 and 15) from /proc/<pid>/stat.
///
/// The command name in field 2 may contain spaces, so fields are counted
/// from the closing parenthesis.
fn parse_cpu_time(stat: &str, ticks_per_sec: u64) -> Option<Duration> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    let mut fields = after_comm.split_whitespace();
    // after_comm starts at field 3 (state); utime is field 14.
    let utime: u64 = fields.nth(11)?.parse().ok()?;
    let stime: u64 = fields.next()?.parse().ok()?;
    let ticks = utime + stime;
    let ticks_per_sec = ticks_per_sec.max(1);
    Some(Duration::from_millis(ticks * 1000 / ticks_per_sec))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vm_rss() {
        let status = "Name:\tpython3\nVmPeak:\t  20000 kB\nVmRSS:\t   8192 kB\nThreads:\t1\n";
        assert_eq!(parse_vm_rss(status), Some(8192));
        assert_eq!(parse_vm_rss("Name:\tzombie\n"), None);
    }

    #[test]
    fn test_parse_cpu_time_with_spaces_in_name() {
        let stat = "4242 (my prog) R 1 4242 4242 0 -1 4194304 100 0 0 0 150 50 0 0 20 0 1 0 1 0 0";
        assert_eq!(parse_cpu_time(stat, 100), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_usage_detects_memory() {
        let policy = SandboxPolicy::default().with_memory_mb(10);
        let mut usage = Usage::default();

        usage.observe(Sample {
            rss_kb: 5 * 1024,
            cpu: Duration::ZERO,
        });
        assert_eq!(usage.exceeded(&policy), None);

        usage.observe(Sample {
            rss_kb: 11 * 1024,
            cpu: Duration::ZERO,
        });
        assert_eq!(usage.exceeded(&policy), Some(ResourceKind::Memory));
        assert_eq!(usage.peak_rss_kb, Some(11 * 1024));
    }

    #[test]
    fn test_usage_detects_cpu_after_allowance() {
        let policy = SandboxPolicy::default().with_cpu_seconds(1);
        let mut usage = Usage::default();

        usage.observe(Sample {
            rss_kb: 0,
            cpu: Duration::from_millis(1900),
        });
        assert_eq!(usage.exceeded(&policy), None);

        usage.observe(Sample {
            rss_kb: 0,
            cpu: Duration::from_millis(2100),
        });
        assert_eq!(usage.exceeded(&policy), Some(ResourceKind::Cpu));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_sample_self() {
        let sample = sample(std::process::id()).expect("procfs available");
        assert!(sample.rss_kb > 0);
    }
}
