//! Execution contract between the orchestrator and the execution host.
//!
//! The dispatch loop only ever talks to an [`ExecutionClient`]. Implementations
//! may be in-process (see `infra::execution`) or sit behind a remote transport.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::DispatchError;
use crate::core::experiment::ExperimentPayload;
use crate::util::ExperimentId;

/// Abstraction over task spawning so components stay runtime-agnostic.
pub trait Spawn {
    /// Spawn an async task that returns a future.
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static;
}

/// Resource bounds for one sandboxed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxLimits {
    /// Memory ceiling in bytes.
    pub memory_bytes: u64,
    /// CPU share in cores (1.0 = one full core).
    pub cpu_share: f64,
    /// Wall-clock deadline in seconds.
    pub deadline_secs: u64,
}

impl SandboxLimits {
    /// Deadline as a [`Duration`].
    #[must_use]
    pub const fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 512 * 1024 * 1024,
            cpu_share: 1.0,
            deadline_secs: 60 * 60,
        }
    }
}

/// Start call sent to the execution host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    /// Experiment being started.
    pub experiment_id: ExperimentId,
    /// Script and metadata.
    pub payload: ExperimentPayload,
    /// Bounds to enforce.
    pub limits: SandboxLimits,
}

/// Acknowledgement of a start call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTicket {
    /// Experiment the run belongs to.
    pub experiment_id: ExperimentId,
    /// When the host started the run.
    pub started_at: DateTime<Utc>,
    /// The host was already running this experiment; no duplicate was created.
    pub already_running: bool,
}

/// Poll result for one experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    /// Still executing.
    Running,
    /// Exited with status 0.
    Completed {
        /// Process exit code.
        exit_code: i32,
        /// Where the host kept the run's output.
        output_ref: String,
    },
    /// Crashed, timed out, or was stopped.
    Failed {
        /// Human-readable reason.
        reason: String,
        /// Exit code, when the process reported one.
        exit_code: Option<i32>,
    },
    /// The host has no record of this experiment.
    Unknown,
}

/// Acknowledgement of a stop call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopAck {
    /// The job exited within the grace period after the graceful signal.
    pub acknowledged: bool,
    /// The job was still running when the stop arrived.
    pub was_running: bool,
}

/// Remote-procedure boundary to the execution host. Holds no job state of its own.
#[async_trait]
pub trait ExecutionClient: Send + Sync + 'static {
    /// Start an experiment. Idempotent per experiment id.
    async fn start(&self, request: StartRequest) -> Result<RunTicket, DispatchError>;

    /// Poll an experiment started earlier.
    async fn poll(&self, id: &ExperimentId) -> Result<RunStatus, DispatchError>;

    /// Ask the host to stop an experiment, waiting at most `grace` for it to exit.
    async fn stop(&self, id: &ExperimentId, grace: Duration) -> Result<StopAck, DispatchError>;
}
