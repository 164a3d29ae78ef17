//! cgroup v2 memory and CPU bounds.
//!
//! The limiter is optional: when no writable cgroup v2 hierarchy is found the
//! runner falls back to process rlimits (see [`crate::sandbox::limits`]) and
//! a warning is logged. The wall-clock deadline is enforced by the supervisor
//! either way.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::core::SandboxLimits;
use crate::util::ExperimentId;

/// Period written to `cpu.max`, in microseconds.
const CPU_PERIOD_USEC: u64 = 100_000;

/// Creates one cgroup per run under a parent directory.
#[derive(Debug, Clone)]
pub struct CgroupLimiter {
    root: Option<PathBuf>,
}

impl CgroupLimiter {
    /// Use `root` when it looks like a cgroup v2 directory, otherwise run degraded.
    pub fn detect(root: Option<&Path>) -> Self {
        let root = root.and_then(|path| {
            if path.join("cgroup.controllers").exists() || path.join("cgroup.procs").exists() {
                info!(root = %path.display(), "cgroup v2 limits enabled");
                Some(path.to_path_buf())
            } else {
                warn!(root = %path.display(), "cgroup v2 hierarchy not found; falling back to process rlimits");
                None
            }
        });
        Self { root }
    }

    /// Limiter that never creates cgroups.
    #[must_use]
    pub const fn disabled() -> Self {
        Self { root: None }
    }

    /// Whether limits will be enforced.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.root.is_some()
    }

    /// Create and configure a cgroup for one run. `None` means degraded.
    pub fn create(&self, id: &ExperimentId, limits: &SandboxLimits) -> Option<CgroupHandle> {
        let root = self.root.as_ref()?;
        let path = root.join(format!("reactorlab-{id}"));
        let setup = || -> std::io::Result<()> {
            fs::create_dir_all(&path)?;
            fs::write(path.join("memory.max"), limits.memory_bytes.to_string())?;
            fs::write(path.join("cpu.max"), cpu_max(limits.cpu_share))?;
            Ok(())
        };
        match setup() {
            Ok(()) => {
                debug!(experiment = %id, cgroup = %path.display(), "cgroup created");
                Some(CgroupHandle { path })
            }
            Err(err) => {
                warn!(experiment = %id, error = %err, "cgroup setup failed; falling back to process rlimits");
                let _ = fs::remove_dir(&path);
                None
            }
        }
    }
}

/// `cpu.max` line for a share expressed in cores.
#[must_use]
pub fn cpu_max(cpu_share: f64) -> String {
    // Precision loss is irrelevant at microsecond granularity.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    let quota = ((cpu_share * CPU_PERIOD_USEC as f64).round() as u64).max(1_000);
    format!("{quota} {CPU_PERIOD_USEC}")
}

/// A live cgroup directory owned by one run.
#[derive(Debug)]
pub struct CgroupHandle {
    path: PathBuf,
}

impl CgroupHandle {
    /// Directory of this cgroup.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Move a process into this cgroup.
    pub fn attach(&self, pid: u32) -> std::io::Result<()> {
        fs::write(self.path.join("cgroup.procs"), pid.to_string())
    }

    /// Remove the directory. Must be called after every member process exited.
    pub fn remove(self) {
        if let Err(err) = fs::remove_dir(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(cgroup = %self.path.display(), error = %err, "failed to remove cgroup");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_max_scales_with_share() {
        assert_eq!(cpu_max(1.0), "100000 100000");
        assert_eq!(cpu_max(0.5), "50000 100000");
        assert_eq!(cpu_max(0.0), "1000 100000");
    }

    #[test]
    fn missing_hierarchy_runs_degraded() {
        let dir = tempfile::tempdir().unwrap();
        let limiter = CgroupLimiter::detect(Some(dir.path()));
        assert!(!limiter.is_enabled());
        assert!(limiter
            .create(&ExperimentId::from("x"), &SandboxLimits::default())
            .is_none());
    }

    #[test]
    fn writes_limits_into_fake_hierarchy() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("cgroup.controllers"), "cpu memory").unwrap();
        let limiter = CgroupLimiter::detect(Some(dir.path()));
        let handle = limiter
            .create(&ExperimentId::from("x"), &SandboxLimits::default())
            .unwrap();
        let memory = fs::read_to_string(handle.path().join("memory.max")).unwrap();
        assert_eq!(memory, (512u64 * 1024 * 1024).to_string());
        handle.attach(42).unwrap();
        // A plain directory still holds the files we wrote; only check no panic.
        handle.remove();
    }
}
