//! Execution host: the node side of the start/poll/stop contract.
//!
//! Runs are tracked in one lock-guarded table shared by the dispatch-facing
//! calls and the operator calls (logs, results, health). At most one run is
//! active; finished runs are kept in a bounded history so late polls still
//! see their outcome.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::core::{DispatchError, RunStatus, RunTicket, Spawn, StartRequest, StopAck};
use crate::hardware::{DeviceStatus, HardwareGateway};
use crate::sandbox::workspace::read_tail_lines;
use crate::sandbox::{RunHandle, SandboxError, SandboxOutcome, SandboxRunner};
use crate::util::ExperimentId;

/// Finished runs remembered for late polls.
pub const DEFAULT_HISTORY: usize = 32;

/// Operator-facing failures.
#[derive(Debug, Error)]
pub enum HostError {
    /// No run with this id is known.
    #[error("no run for experiment {0}")]
    UnknownExperiment(ExperimentId),
    /// Reading run artifacts failed.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

/// Node health snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHealth {
    /// Experiment currently executing.
    pub active_run: Option<ExperimentId>,
    /// Per-device availability.
    pub devices: BTreeMap<String, DeviceStatus>,
}

/// One entry of [`ExecutionHost::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Experiment the run belongs to.
    pub experiment_id: ExperimentId,
    /// When the process was started.
    pub started_at: DateTime<Utc>,
    /// Same answer [`ExecutionHost::poll`] gives.
    pub status: RunStatus,
}

#[derive(Default)]
struct RunTable {
    runs: HashMap<ExperimentId, RunHandle>,
    order: VecDeque<ExperimentId>,
}

impl RunTable {
    fn active(&self) -> Option<&RunHandle> {
        self.runs.values().find(|h| !h.is_finished())
    }

    fn forget(&mut self, id: &ExperimentId) {
        self.runs.remove(id);
        self.order.retain(|known| known != id);
    }

    fn prune(&mut self, keep: usize) {
        while self.order.len() > keep {
            let Some(pos) = self
                .order
                .iter()
                .position(|id| self.runs.get(id).is_none_or(RunHandle::is_finished))
            else {
                break;
            };
            if let Some(id) = self.order.remove(pos) {
                self.runs.remove(&id);
            }
        }
    }
}

/// Owns the sandbox runner and the device gateway of one node.
pub struct ExecutionHost<S> {
    runner: SandboxRunner<S>,
    gateway: Arc<HardwareGateway>,
    table: Mutex<RunTable>,
    history: usize,
}

impl<S: Spawn> ExecutionHost<S> {
    /// Host over a runner and a gateway.
    pub fn new(runner: SandboxRunner<S>, gateway: Arc<HardwareGateway>) -> Self {
        Self {
            runner,
            gateway,
            table: Mutex::new(RunTable::default()),
            history: DEFAULT_HISTORY,
        }
    }

    /// Override how many finished runs are remembered.
    #[must_use]
    pub fn with_history(mut self, history: usize) -> Self {
        self.history = history.max(1);
        self
    }

    /// Device gateway the jobs talk to.
    pub const fn gateway(&self) -> &Arc<HardwareGateway> {
        &self.gateway
    }

    /// Start a run. Repeated starts of the same experiment return the existing run.
    pub fn start(&self, request: StartRequest) -> Result<RunTicket, DispatchError> {
        let mut table = self.table.lock();
        if let Some(existing) = table.runs.get(&request.experiment_id) {
            info!(experiment = %request.experiment_id, "start repeated; returning existing run");
            return Ok(RunTicket {
                experiment_id: request.experiment_id,
                started_at: existing.started_at(),
                already_running: true,
            });
        }
        if let Some(active) = table.active() {
            return Err(DispatchError::Rejected(format!(
                "host busy with experiment {}",
                active.experiment_id()
            )));
        }
        let handle = self
            .runner
            .run(&request.experiment_id, &request.payload, &request.limits)
            .map_err(|err| {
                warn!(experiment = %request.experiment_id, error = %err, "sandbox could not be started");
                DispatchError::Rejected(err.to_string())
            })?;
        let ticket = RunTicket {
            experiment_id: request.experiment_id.clone(),
            started_at: handle.started_at(),
            already_running: false,
        };
        table.runs.insert(request.experiment_id.clone(), handle);
        table.order.push_back(request.experiment_id);
        table.prune(self.history);
        Ok(ticket)
    }

    fn handle(&self, id: &ExperimentId) -> Option<RunHandle> {
        self.table.lock().runs.get(id).cloned()
    }

    /// Current status of a run.
    pub fn poll(&self, id: &ExperimentId) -> RunStatus {
        self.handle(id)
            .map_or(RunStatus::Unknown, |handle| run_status(&handle))
    }

    /// Request a graceful stop and wait up to `grace` for the job to exit.
    pub async fn stop(&self, id: &ExperimentId, grace: Duration) -> StopAck {
        let Some(handle) = self.handle(id) else {
            return StopAck {
                acknowledged: true,
                was_running: false,
            };
        };
        if handle.is_finished() {
            return StopAck {
                acknowledged: true,
                was_running: false,
            };
        }
        handle.stop();
        let acknowledged = match tokio::time::timeout(grace, handle.wait()).await {
            Ok(SandboxOutcome::Stopped { forced } | SandboxOutcome::TimedOut { forced }) => !forced,
            Ok(_) => true,
            Err(_) => false,
        };
        info!(experiment = %id, acknowledged, "stop processed");
        StopAck {
            acknowledged,
            was_running: true,
        }
    }

    /// Known runs, oldest first.
    pub fn list(&self) -> Vec<RunSummary> {
        let table = self.table.lock();
        table
            .order
            .iter()
            .filter_map(|id| table.runs.get(id))
            .map(|handle| RunSummary {
                experiment_id: handle.experiment_id().clone(),
                started_at: handle.started_at(),
                status: run_status(handle),
            })
            .collect()
    }

    /// Stop the run if it is still active, then delete its directory and forget it.
    ///
    /// Directories of runs from before a restart are removed too; an id with
    /// neither a run nor a directory is unknown.
    pub async fn remove(&self, id: &ExperimentId) -> Result<(), HostError> {
        let handle = self.handle(id);
        let run_dir = self.runner.settings().work_root.join(id.as_str());
        let on_disk = tokio::fs::try_exists(&run_dir).await.unwrap_or(false);
        if handle.is_none() && !on_disk {
            return Err(HostError::UnknownExperiment(id.clone()));
        }
        if let Some(handle) = handle.filter(|h| !h.is_finished()) {
            handle.stop();
            let outcome = handle.wait().await;
            info!(experiment = %id, ?outcome, "active run stopped for removal");
        }
        if on_disk {
            tokio::fs::remove_dir_all(&run_dir)
                .await
                .map_err(|source| SandboxError::Io {
                    path: run_dir.clone(),
                    source,
                })?;
        }
        self.table.lock().forget(id);
        info!(experiment = %id, dir = %run_dir.display(), "run removed");
        Ok(())
    }

    /// Last `tail` lines of a run's captured output.
    pub fn logs(&self, id: &ExperimentId, tail: usize) -> Result<Vec<String>, HostError> {
        let handle = self
            .handle(id)
            .ok_or_else(|| HostError::UnknownExperiment(id.clone()))?;
        if !handle.log_path().exists() {
            return Ok(Vec::new());
        }
        Ok(read_tail_lines(handle.log_path(), tail)?)
    }

    /// Files a run produced, relative to its output directory.
    pub fn results(&self, id: &ExperimentId) -> Result<Vec<PathBuf>, HostError> {
        let handle = self
            .handle(id)
            .ok_or_else(|| HostError::UnknownExperiment(id.clone()))?;
        let root = handle.output_dir();
        let mut files: Vec<PathBuf> = WalkDir::new(root)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| entry.path().strip_prefix(root).ok().map(PathBuf::from))
            .collect();
        files.sort();
        Ok(files)
    }

    /// Device status and the active run.
    pub fn health(&self) -> NodeHealth {
        NodeHealth {
            active_run: self.table.lock().active().map(|h| h.experiment_id().clone()),
            devices: self.gateway.registry().status(),
        }
    }
}

fn run_status(handle: &RunHandle) -> RunStatus {
    match handle.outcome() {
        None => RunStatus::Running,
        Some(SandboxOutcome::Completed) => RunStatus::Completed {
            exit_code: 0,
            output_ref: handle.output_dir().display().to_string(),
        },
        Some(SandboxOutcome::Crashed {
            exit_code,
            signal,
            message,
        }) => {
            let cause = match (exit_code, signal) {
                (Some(code), _) => format!("exit code {code}"),
                (None, Some(sig)) => format!("signal {sig}"),
                (None, None) => "unknown cause".to_string(),
            };
            RunStatus::Failed {
                reason: format!("job crashed ({cause}): {message}"),
                exit_code,
            }
        }
        Some(SandboxOutcome::TimedOut { forced }) => RunStatus::Failed {
            reason: if forced {
                "timed out: deadline exceeded, job killed".into()
            } else {
                "timed out: deadline exceeded".into()
            },
            exit_code: None,
        },
        Some(SandboxOutcome::Stopped { forced }) => RunStatus::Failed {
            reason: if forced {
                "stopped: forced termination".into()
            } else {
                "stopped on request".into()
            },
            exit_code: None,
        },
    }
}
