//! Per-process resource limits for runs without a cgroup.
//!
//! `RLIMIT_AS` stands in for the memory ceiling. The CPU share becomes a
//! `RLIMIT_CPU` budget of `deadline * share` seconds, which bounds total CPU
//! time rather than the rate. Limits are applied to the spawned pid and are
//! inherited by everything the job forks afterwards.

use rlimit::Resource;

use crate::core::SandboxLimits;

/// Soft and hard limits for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessLimit {
    /// Limited resource.
    pub resource: Resource,
    /// Soft limit.
    pub soft: u64,
    /// Hard limit.
    pub hard: u64,
}

/// CPU seconds granted over the whole run.
#[must_use]
pub fn cpu_budget_secs(limits: &SandboxLimits) -> u64 {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    let secs = (limits.deadline_secs as f64 * limits.cpu_share).ceil() as u64;
    secs.max(1)
}

/// Limits to set on a job process.
#[must_use]
pub fn process_limits(limits: &SandboxLimits) -> Vec<ProcessLimit> {
    let cpu = cpu_budget_secs(limits);
    vec![
        ProcessLimit {
            resource: Resource::AS,
            soft: limits.memory_bytes,
            hard: limits.memory_bytes,
        },
        // SIGXCPU at the soft limit, SIGKILL one second later.
        ProcessLimit {
            resource: Resource::CPU,
            soft: cpu,
            hard: cpu.saturating_add(1),
        },
    ]
}

/// Set `limits` on a running process.
pub fn apply(pid: u32, limits: &SandboxLimits) -> std::io::Result<()> {
    let pid = i32::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    for limit in process_limits(limits) {
        rlimit::prlimit(pid, limit.resource, Some((limit.soft, limit.hard)), None)?;
    }
    Ok(())
}
