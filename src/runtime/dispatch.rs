//! Background dispatch loop.
//!
//! Each tick either drives the RUNNING experiment (start retries, polling,
//! requested stops) or, when nothing runs, dispatches the head of the queue.
//! The loop sleeps for the tick interval but wakes early when the queue
//! signals new work, and exits cooperatively on shutdown. Stops run on their
//! own task so a job that sits out its grace period never holds up the loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::core::{
    DispatchError, ExecutionClient, Experiment, QueueError, QueueManager, QueueStore, RunStatus,
    SandboxLimits, Spawn, StartRequest, StopAck, StoreError,
};
use crate::runtime::shutdown::ShutdownToken;
use crate::util::clock::now;
use crate::util::ExperimentId;

/// Reason recorded when a running job ignored a stop within the grace period.
pub const FORCED_TERMINATION_REASON: &str = "forced termination";

/// Dispatch loop tuning.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Interval between ticks.
    pub tick: Duration,
    /// Transient failures tolerated per job before it is failed.
    pub max_retries: u32,
    /// Base delay before a retry; doubles with each consecutive failure.
    pub retry_backoff: Duration,
    /// Grace period granted to a running job on cancel.
    pub cancel_grace: Duration,
    /// Retention sweep interval; `None` disables the periodic sweep.
    pub cleanup_interval: Option<Duration>,
    /// Limits sent with every start.
    pub limits: SandboxLimits,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(2),
            max_retries: 3,
            retry_backoff: Duration::from_secs(1),
            cancel_grace: Duration::from_secs(30),
            cleanup_interval: None,
            limits: SandboxLimits::default(),
        }
    }
}

/// The job the loop is currently responsible for.
struct ActiveJob {
    experiment: Experiment,
    started: bool,
    adopted: bool,
    failures: u32,
    retry_at: Option<Instant>,
    stopping: Option<JoinHandle<Result<StopAck, DispatchError>>>,
}

impl ActiveJob {
    fn dispatched(experiment: Experiment) -> Self {
        Self {
            experiment,
            started: false,
            adopted: false,
            failures: 0,
            retry_at: None,
            stopping: None,
        }
    }

    /// A RUNNING experiment this loop did not start, e.g. after a restart.
    fn adopted(experiment: Experiment) -> Self {
        Self {
            experiment,
            started: true,
            adopted: true,
            failures: 0,
            retry_at: None,
            stopping: None,
        }
    }
}

/// What happened to the active job during one step.
enum Step {
    Keep,
    Done,
}

/// Moves experiments from the queue to the execution host and records outcomes.
pub struct DispatchWorker<S, C> {
    queue: Arc<QueueManager<S>>,
    client: Arc<C>,
    config: DispatchConfig,
    shutdown: ShutdownToken,
    active: Option<ActiveJob>,
    next_cleanup: Option<Instant>,
}

impl<S, C> DispatchWorker<S, C>
where
    S: QueueStore + 'static,
    C: ExecutionClient,
{
    /// Worker over a queue and an execution client.
    pub fn new(
        queue: Arc<QueueManager<S>>,
        client: Arc<C>,
        config: DispatchConfig,
        shutdown: ShutdownToken,
    ) -> Self {
        let next_cleanup = config.cleanup_interval.map(|every| Instant::now() + every);
        Self {
            queue,
            client,
            config,
            shutdown,
            active: None,
            next_cleanup,
        }
    }

    /// Run the loop until the shutdown token fires.
    pub async fn run(mut self) {
        info!(tick_ms = self.config.tick.as_millis(), "dispatch worker started");
        let wake = self.queue.wake_handle();
        while !self.shutdown.is_cancelled() {
            if let Err(err) = self.tick().await {
                error!(error = %err, "dispatch tick failed");
            }
            self.maybe_cleanup().await;
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = tokio::time::sleep(self.config.tick) => {}
                () = wake.notified() => debug!("dispatch worker woken early"),
            }
        }
        info!("dispatch worker stopped");
    }

    /// Spawn [`DispatchWorker::run`] on `spawner`.
    pub fn spawn(self, spawner: &impl Spawn) {
        spawner.spawn(self.run());
    }

    /// One scheduling step.
    pub async fn tick(&mut self) -> Result<(), QueueError> {
        let Some(running) = self.queue.running() else {
            self.active = None;
            return self.dispatch_next().await;
        };
        let mut job = match self.active.take() {
            Some(job) if job.experiment.id == running.id => job,
            _ => {
                info!(experiment = %running.id, "adopting running experiment");
                ActiveJob::adopted(running.clone())
            }
        };
        if job.retry_at.is_some_and(|at| Instant::now() < at) {
            self.active = Some(job);
            return Ok(());
        }
        let step = if running.cancel_requested {
            self.stop_job(&mut job).await?
        } else if job.started {
            self.poll_job(&mut job).await?
        } else {
            self.start_job(&mut job).await?
        };
        if matches!(step, Step::Keep) {
            self.active = Some(job);
        }
        Ok(())
    }

    async fn dispatch_next(&mut self) -> Result<(), QueueError> {
        let Some(experiment) = self.durable(|q| q.next()).await? else {
            return Ok(());
        };
        let mut job = ActiveJob::dispatched(experiment);
        if matches!(self.start_job(&mut job).await?, Step::Keep) {
            self.active = Some(job);
        }
        Ok(())
    }

    async fn start_job(&self, job: &mut ActiveJob) -> Result<Step, QueueError> {
        let id = job.experiment.id.clone();
        let request = StartRequest {
            experiment_id: id.clone(),
            payload: job.experiment.payload.clone(),
            limits: self.config.limits.clone(),
        };
        match self.client.start(request).await {
            Ok(ticket) => {
                info!(experiment = %id, already_running = ticket.already_running, "execution started");
                job.started = true;
                job.failures = 0;
                job.retry_at = None;
                Ok(Step::Keep)
            }
            Err(DispatchError::Rejected(reason)) => {
                let reason = format!("rejected by execution host: {reason}");
                self.durable(move |q| q.fail(&id, None, reason)).await?;
                Ok(Step::Done)
            }
            Err(err) => self.transient_failure(job, &err).await,
        }
    }

    async fn poll_job(&self, job: &mut ActiveJob) -> Result<Step, QueueError> {
        let id = job.experiment.id.clone();
        match self.client.poll(&id).await {
            Ok(RunStatus::Running) => {
                job.failures = 0;
                job.retry_at = None;
                Ok(Step::Keep)
            }
            Ok(RunStatus::Unknown) if job.adopted => {
                self.durable(move |q| q.reconcile_running(|candidate| candidate != &id))
                    .await?;
                Ok(Step::Done)
            }
            Ok(status) => {
                self.record(&id, status).await?;
                Ok(Step::Done)
            }
            Err(DispatchError::Rejected(reason)) => {
                self.durable(move |q| q.fail(&id, None, reason)).await?;
                Ok(Step::Done)
            }
            Err(err) => self.transient_failure(job, &err).await,
        }
    }

    /// Issue the stop on its own task, then settle once that task resolves.
    async fn stop_job(&self, job: &mut ActiveJob) -> Result<Step, QueueError> {
        let id = job.experiment.id.clone();
        let Some(pending) = job.stopping.take() else {
            let grace = self.config.cancel_grace;
            info!(experiment = %id, grace_ms = grace.as_millis(), "stopping running experiment");
            let client = Arc::clone(&self.client);
            job.stopping = Some(tokio::spawn(async move { client.stop(&id, grace).await }));
            return Ok(Step::Keep);
        };
        if !pending.is_finished() {
            job.stopping = Some(pending);
            return Ok(Step::Keep);
        }
        let result = pending.await.unwrap_or_else(|err| {
            Err(DispatchError::DispatchFailure(format!("stop task failed: {err}")))
        });
        match result {
            Ok(ack) if ack.was_running => {
                if ack.acknowledged {
                    self.durable(move |q| q.confirm_cancelled(&id)).await?;
                } else {
                    self.durable(move |q| q.fail(&id, None, FORCED_TERMINATION_REASON))
                        .await?;
                }
                Ok(Step::Done)
            }
            Ok(_) => {
                // Nothing was running; keep a natural outcome if the host has one.
                match self.client.poll(&id).await {
                    Ok(status @ (RunStatus::Completed { .. } | RunStatus::Failed { .. })) => {
                        self.record(&id, status).await?;
                    }
                    _ => {
                        self.durable(move |q| q.confirm_cancelled(&id)).await?;
                    }
                }
                Ok(Step::Done)
            }
            Err(err) => self.transient_failure(job, &err).await,
        }
    }

    async fn record(&self, id: &ExperimentId, status: RunStatus) -> Result<(), QueueError> {
        let id = id.clone();
        match status {
            RunStatus::Completed { exit_code, output_ref } => {
                debug!(experiment = %id, output = %output_ref, "run output kept");
                self.durable(move |q| q.complete(&id, exit_code)).await?;
            }
            RunStatus::Failed { reason, exit_code } => {
                self.durable(move |q| q.fail(&id, exit_code, reason)).await?;
            }
            RunStatus::Unknown => {
                self.durable(move |q| q.fail(&id, None, "execution host lost track of the run"))
                    .await?;
            }
            RunStatus::Running => {}
        }
        Ok(())
    }

    async fn transient_failure(
        &self,
        job: &mut ActiveJob,
        err: &DispatchError,
    ) -> Result<Step, QueueError> {
        job.failures += 1;
        let id = job.experiment.id.clone();
        if job.failures > self.config.max_retries {
            error!(experiment = %id, attempts = job.failures, error = %err, "giving up on experiment");
            let reason = format!("dispatch failed after {} attempts: {err}", job.failures);
            self.durable(move |q| q.fail(&id, None, reason)).await?;
            return Ok(Step::Done);
        }
        let backoff = self
            .config
            .retry_backoff
            .saturating_mul(1 << (job.failures - 1).min(16));
        warn!(experiment = %id, attempt = job.failures, backoff_ms = backoff.as_millis(), error = %err, "transient dispatch failure; will retry");
        job.retry_at = Some(Instant::now() + backoff);
        Ok(Step::Keep)
    }

    async fn maybe_cleanup(&mut self) {
        let (Some(at), Some(every)) = (self.next_cleanup, self.config.cleanup_interval) else {
            return;
        };
        if Instant::now() < at {
            return;
        }
        self.next_cleanup = Some(Instant::now() + every);
        if let Err(err) = self.durable(|q| q.cleanup_expired(now())).await {
            warn!(error = %err, "retention sweep failed");
        }
    }

    /// Run a queue mutation on the blocking pool so its durable write never
    /// stalls a runtime worker.
    async fn durable<T, F>(&self, f: F) -> Result<T, QueueError>
    where
        T: Send + 'static,
        F: FnOnce(&QueueManager<S>) -> Result<T, QueueError> + Send + 'static,
    {
        let queue = Arc::clone(&self.queue);
        match tokio::task::spawn_blocking(move || f(&queue)).await {
            Ok(result) => result,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(err) => Err(QueueError::Persistence(StoreError::Unavailable(format!(
                "queue write did not run: {err}"
            )))),
        }
    }
}

impl<S, C> DispatchWorker<S, C> {
    /// Token that stops this worker.
    pub const fn shutdown_token(&self) -> &ShutdownToken {
        &self.shutdown
    }
}
