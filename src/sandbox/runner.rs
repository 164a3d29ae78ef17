//! Job process lifecycle: spawn, supervise, stop, tear down.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

use crate::core::{ExperimentPayload, SandboxLimits, Spawn};
use crate::sandbox::cgroup::{CgroupHandle, CgroupLimiter};
use crate::sandbox::limits as process_limits;
use crate::sandbox::workspace::{read_tail_bytes, Workspace};
use crate::sandbox::SandboxError;
use crate::util::clock::now;
use crate::util::ExperimentId;

/// Bytes of log tail kept as a crash message.
pub const CRASH_MESSAGE_BYTES: u64 = 500;

/// Host-level settings shared by every run.
#[derive(Debug, Clone)]
pub struct SandboxSettings {
    /// Parent of all run directories.
    pub work_root: PathBuf,
    /// Interpreter program and leading arguments; the entry file is appended.
    pub interpreter: Vec<String>,
    /// Endpoint the job uses to reach the hardware gateway.
    pub gateway_url: String,
    /// Wait between the graceful signal and forced termination.
    pub grace_period: Duration,
    /// `PATH` exported to the job.
    pub path_env: String,
    /// Optional cgroup v2 parent directory.
    pub cgroup_root: Option<PathBuf>,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            work_root: PathBuf::from("/var/lib/reactorlab/runs"),
            interpreter: vec!["python3".into(), "-u".into()],
            gateway_url: "http://127.0.0.1:5000".into(),
            grace_period: Duration::from_secs(10),
            path_env: "/usr/local/bin:/usr/bin:/bin".into(),
            cgroup_root: None,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SandboxOutcome {
    /// Exited with status 0.
    Completed,
    /// Nonzero exit or killed by a signal.
    Crashed {
        /// Exit code, absent when killed by a signal.
        exit_code: Option<i32>,
        /// Terminating signal, if any.
        signal: Option<i32>,
        /// Tail of the captured output.
        message: String,
    },
    /// Wall-clock deadline elapsed.
    TimedOut {
        /// The job ignored the graceful signal and was killed.
        forced: bool,
    },
    /// A stop was requested.
    Stopped {
        /// The job ignored the graceful signal and was killed.
        forced: bool,
    },
}

struct RunShared {
    experiment_id: ExperimentId,
    started_at: DateTime<Utc>,
    output_dir: PathBuf,
    log_path: PathBuf,
    stop: Notify,
    stop_requested: AtomicBool,
    outcome: watch::Receiver<Option<SandboxOutcome>>,
}

/// Handle to one run. Cheap to clone.
#[derive(Clone)]
pub struct RunHandle {
    shared: Arc<RunShared>,
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("experiment_id", &self.shared.experiment_id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl RunHandle {
    /// Experiment this run belongs to.
    #[must_use]
    pub fn experiment_id(&self) -> &ExperimentId {
        &self.shared.experiment_id
    }

    /// When the process was started.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.shared.started_at
    }

    /// Job-writable output directory; survives teardown.
    #[must_use]
    pub fn output_dir(&self) -> &std::path::Path {
        &self.shared.output_dir
    }

    /// Captured stdout and stderr.
    #[must_use]
    pub fn log_path(&self) -> &std::path::Path {
        &self.shared.log_path
    }

    /// Outcome, once teardown has finished.
    #[must_use]
    pub fn outcome(&self) -> Option<SandboxOutcome> {
        self.shared.outcome.borrow().clone()
    }

    /// Whether the run ended and was torn down.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.shared.outcome.borrow().is_some()
    }

    /// Wait for the run to end. Only the awaiting task is suspended.
    pub async fn wait(&self) -> SandboxOutcome {
        let mut rx = self.shared.outcome.clone();
        let result = rx.wait_for(Option::is_some).await.map(|o| o.clone());
        match result {
            Ok(Some(outcome)) => outcome,
            _ => SandboxOutcome::Crashed {
                exit_code: None,
                signal: None,
                message: "sandbox supervisor exited without an outcome".into(),
            },
        }
    }

    /// Request a graceful stop. Idempotent; a no-op once the run finished.
    pub fn stop(&self) {
        if self.is_finished() {
            return;
        }
        if !self.shared.stop_requested.swap(true, Ordering::SeqCst) {
            debug!(experiment = %self.shared.experiment_id, "stop requested");
            self.shared.stop.notify_one();
        }
    }
}

/// Spawns and supervises job processes.
pub struct SandboxRunner<S> {
    settings: SandboxSettings,
    cgroups: CgroupLimiter,
    spawner: S,
}

impl<S: Spawn> SandboxRunner<S> {
    /// Runner using `spawner` for supervisor tasks.
    pub fn new(settings: SandboxSettings, spawner: S) -> Self {
        let cgroups = CgroupLimiter::detect(settings.cgroup_root.as_deref());
        Self {
            settings,
            cgroups,
            spawner,
        }
    }

    /// Host-level settings.
    pub const fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    /// Start `payload` under `limits` and return immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn run(
        &self,
        id: &ExperimentId,
        payload: &ExperimentPayload,
        limits: &SandboxLimits,
    ) -> Result<RunHandle, SandboxError> {
        let program = self
            .settings
            .interpreter
            .first()
            .ok_or_else(|| SandboxError::Setup("interpreter command is empty".into()))?;
        let workspace = Workspace::prepare(&self.settings.work_root, id, payload)?;
        let mut teardown = Teardown {
            workspace,
            cgroup: self.cgroups.create(id, limits),
            done: false,
        };

        let log_path = teardown.workspace.log_path();
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|source| SandboxError::Io {
                path: log_path.clone(),
                source,
            })?;
        let log_err = log.try_clone().map_err(|source| SandboxError::Io {
            path: log_path.clone(),
            source,
        })?;

        let output_dir = teardown.workspace.output_dir().to_path_buf();
        let mut command = Command::new(program);
        command
            .args(&self.settings.interpreter[1..])
            .arg(teardown.workspace.entry_path())
            .current_dir(&output_dir)
            .env_clear()
            .envs(job_env(&self.settings, id, &output_dir))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .process_group(0)
            .kill_on_drop(true);

        // On error the teardown guard drops here and reclaims the workspace.
        let child = command.spawn().map_err(SandboxError::Spawn)?;
        let enforcement = match (teardown.cgroup.as_ref(), child.id()) {
            (Some(cgroup), Some(pid)) => match cgroup.attach(pid) {
                Ok(()) => "cgroup",
                Err(err) => {
                    warn!(experiment = %id, error = %err, "failed to attach job to cgroup");
                    "none"
                }
            },
            (None, Some(pid)) => match process_limits::apply(pid, limits) {
                Ok(()) => "rlimit",
                Err(err) => {
                    warn!(experiment = %id, error = %err, "failed to set process limits; memory is unbounded");
                    "none"
                }
            },
            (_, None) => "none",
        };

        let (tx, rx) = watch::channel(None);
        let shared = Arc::new(RunShared {
            experiment_id: id.clone(),
            started_at: now(),
            output_dir,
            log_path,
            stop: Notify::new(),
            stop_requested: AtomicBool::new(false),
            outcome: rx,
        });
        info!(
            experiment = %id,
            pid = ?child.id(),
            deadline_secs = limits.deadline_secs,
            enforcement,
            "sandbox started"
        );
        self.spawner.spawn(supervise(
            child,
            Arc::clone(&shared),
            tx,
            teardown,
            limits.deadline(),
            self.settings.grace_period,
        ));
        Ok(RunHandle { shared })
    }

    /// Wait for a run to end.
    pub async fn wait(&self, handle: &RunHandle) -> SandboxOutcome {
        handle.wait().await
    }

    /// Request a graceful stop of a run.
    pub fn stop(&self, handle: &RunHandle) {
        handle.stop();
    }
}

fn job_env(
    settings: &SandboxSettings,
    id: &ExperimentId,
    output_dir: &std::path::Path,
) -> BTreeMap<&'static str, String> {
    let output = output_dir.display().to_string();
    BTreeMap::from([
        ("PATH", settings.path_env.clone()),
        ("HOME", output.clone()),
        ("LANG", "C.UTF-8".to_string()),
        ("EXPERIMENT_ID", id.to_string()),
        ("OUTPUT_DIR", output),
        ("GATEWAY_URL", settings.gateway_url.clone()),
        ("BIOREACTOR_NODE_API_URL", settings.gateway_url.clone()),
    ])
}

/// Reclaims the workspace and cgroup exactly once, on every exit path.
struct Teardown {
    workspace: Workspace,
    cgroup: Option<CgroupHandle>,
    done: bool,
}

impl Teardown {
    fn run(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.workspace.teardown();
        if let Some(cgroup) = self.cgroup.take() {
            cgroup.remove();
        }
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        self.run();
    }
}

async fn supervise(
    mut child: Child,
    shared: Arc<RunShared>,
    tx: watch::Sender<Option<SandboxOutcome>>,
    mut teardown: Teardown,
    deadline: Duration,
    grace: Duration,
) {
    let id = &shared.experiment_id;
    // A natural exit wins over a deadline or stop that becomes ready in the same poll.
    let outcome = tokio::select! {
        biased;
        status = child.wait() => exit_outcome(status, &shared),
        () = tokio::time::sleep(deadline) => {
            warn!(experiment = %id, deadline_secs = deadline.as_secs(), "deadline elapsed; stopping job");
            SandboxOutcome::TimedOut { forced: terminate(&mut child, grace).await }
        }
        () = shared.stop.notified() => {
            SandboxOutcome::Stopped { forced: terminate(&mut child, grace).await }
        }
    };
    teardown.run();
    info!(experiment = %id, ?outcome, "sandbox finished");
    tx.send_replace(Some(outcome));
}

fn exit_outcome(status: std::io::Result<ExitStatus>, shared: &RunShared) -> SandboxOutcome {
    match status {
        Ok(status) if status.success() => SandboxOutcome::Completed,
        Ok(status) => {
            let tail = read_tail_bytes(&shared.log_path, CRASH_MESSAGE_BYTES);
            let message = if tail.is_empty() {
                format!("job exited with {status}")
            } else {
                tail
            };
            SandboxOutcome::Crashed {
                exit_code: status.code(),
                signal: status.signal(),
                message,
            }
        }
        Err(err) => {
            error!(experiment = %shared.experiment_id, error = %err, "failed to wait on job process");
            SandboxOutcome::Crashed {
                exit_code: None,
                signal: None,
                message: format!("lost track of job process: {err}"),
            }
        }
    }
}

/// SIGTERM the job's process group, wait `grace`, then SIGKILL. Returns `true` when forced.
async fn terminate(child: &mut Child, grace: Duration) -> bool {
    let group = child.id().and_then(|pid| i32::try_from(pid).ok()).map(Pid::from_raw);
    if let Some(group) = group {
        if let Err(err) = killpg(group, Signal::SIGTERM) {
            debug!(error = %err, "SIGTERM delivery failed");
        }
    }
    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
        return false;
    }
    let killed = group.is_some_and(|g| killpg(g, Signal::SIGKILL).is_ok());
    if !killed {
        let _ = child.start_kill();
    }
    if let Err(err) = child.wait().await {
        error!(error = %err, "failed to reap killed job process");
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exited_child_beats_ready_deadline_and_stop() {
        let root = tempfile::tempdir().unwrap();
        let id = ExperimentId::from("exp-race");
        let workspace =
            Workspace::prepare(root.path(), &id, &ExperimentPayload::new("exit 0")).unwrap();
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg("exit 0")
            .spawn()
            .unwrap();
        while child.try_wait().unwrap().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let (tx, rx) = watch::channel(None);
        let shared = Arc::new(RunShared {
            experiment_id: id,
            started_at: now(),
            output_dir: workspace.output_dir().to_path_buf(),
            log_path: workspace.log_path(),
            stop: Notify::new(),
            stop_requested: AtomicBool::new(true),
            outcome: rx,
        });
        shared.stop.notify_one();
        let teardown = Teardown {
            workspace,
            cgroup: None,
            done: false,
        };
        supervise(
            child,
            Arc::clone(&shared),
            tx,
            teardown,
            Duration::ZERO,
            Duration::from_millis(50),
        )
        .await;
        assert_eq!(
            shared.outcome.borrow().clone(),
            Some(SandboxOutcome::Completed)
        );
    }
}
