//! Sandboxed execution of one experiment at a time.
//!
//! A run gets its own workspace (read-only payload, writable output), a
//! scrubbed environment, memory and CPU bounds (a cgroup v2 directory when
//! one is configured, process rlimits otherwise), and a supervisor task that enforces the wall-clock deadline and
//! tears everything down before the outcome becomes observable.

pub mod cgroup;
pub mod limits;
pub mod runner;
pub mod workspace;

use std::path::PathBuf;

use thiserror::Error;

pub use cgroup::{CgroupHandle, CgroupLimiter};
pub use runner::{RunHandle, SandboxOutcome, SandboxRunner, SandboxSettings};
pub use workspace::Workspace;

/// Errors raised while setting a run up.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The execution environment could not be allocated.
    #[error("sandbox setup failed: {0}")]
    Setup(String),
    /// The job process could not be started.
    #[error("failed to spawn job process: {0}")]
    Spawn(#[source] std::io::Error),
    /// Filesystem failure at a given path.
    #[error("io error at {path}: {source}")]
    Io {
        /// Path being touched.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}
