//! The experiment state machine.
//!
//! `QueueManager` owns the in-memory [`QueueSnapshot`] and the [`QueueStore`]
//! behind one `parking_lot::Mutex`. Every mutation is applied to a copy of the
//! snapshot, persisted, and only then committed, so a failed durable write
//! leaves memory untouched. After such a failure the manager refuses further
//! mutations until [`QueueManager::recover_persistence`] succeeds.
//!
//! ```text
//! QUEUED --next--> RUNNING --complete--> COMPLETED
//!   |  ^              |------fail------> FAILED
//! pause resume        '--cancel/confirm-> CANCELLED
//!   v  |
//! PAUSED --cancel--> CANCELLED
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::core::audit::{build_audit_event, AuditEvent, AuditSink};
use crate::core::error::QueueError;
use crate::core::experiment::{Experiment, ExperimentPayload, ExperimentState};
use crate::core::store::{QueueSnapshot, QueueStore};
use crate::util::clock::now;
use crate::util::{ExperimentId, OwnerId};

/// Reason recorded when a RUNNING experiment has no sandbox after a restart.
pub const ORPHANED_REASON: &str = "no live sandbox after restart";

/// Minutes of estimated wait per queued experiment.
pub const ESTIMATED_MINUTES_PER_EXPERIMENT: u64 = 10;

/// Quota and retention knobs.
#[derive(Debug, Clone)]
pub struct QueuePolicy {
    /// Maximum experiments per owner in QUEUED, RUNNING or PAUSED.
    pub max_active_per_owner: usize,
    /// Age after which terminal experiments are swept.
    pub retention: Duration,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            max_active_per_owner: 5,
            retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Result of a successful enqueue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enqueued {
    /// New experiment id.
    pub id: ExperimentId,
    /// Zero-based position in the dispatch order.
    pub position: usize,
}

/// What a cancel call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The experiment was QUEUED or PAUSED and is now CANCELLED.
    Cancelled,
    /// The experiment is RUNNING; a stop was recorded for the dispatch loop.
    StopRequested,
}

/// Status view of one experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentStatus {
    /// Identity.
    pub id: ExperimentId,
    /// Submitting owner.
    pub owner: OwnerId,
    /// Lifecycle state.
    pub state: ExperimentState,
    /// Dense position, only while QUEUED.
    pub queue_position: Option<usize>,
    /// Enqueue time.
    pub created_at: DateTime<Utc>,
    /// Dispatch time.
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal transition time.
    pub finished_at: Option<DateTime<Utc>>,
    /// Exit code, when known.
    pub exit_code: Option<i32>,
    /// Failure reason.
    pub error: Option<String>,
}

/// One row of the queue listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Identity.
    pub experiment_id: ExperimentId,
    /// Submitting owner.
    pub owner_id: OwnerId,
    /// Lifecycle state.
    pub state: ExperimentState,
    /// Dense position, only while QUEUED.
    pub queue_position: Option<usize>,
}

/// Aggregate queue view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSummary {
    /// QUEUED count.
    pub queued: usize,
    /// RUNNING count (0 or 1).
    pub running: usize,
    /// PAUSED count.
    pub paused: usize,
    /// Rough wait for a newly enqueued experiment.
    pub estimated_wait_minutes: u64,
    /// Active experiments: running, then queued by position, then paused.
    pub entries: Vec<QueueEntry>,
}

struct Inner<S> {
    snapshot: QueueSnapshot,
    store: S,
    audit: Option<Box<dyn AuditSink>>,
    poisoned: Option<String>,
}

/// Serialized, durable experiment state machine.
///
/// Mutations save under the lock and block the calling thread until the
/// store reports the write durable. Async callers run them on the blocking
/// pool, as [`crate::runtime::DispatchWorker`] does.
pub struct QueueManager<S> {
    inner: Mutex<Inner<S>>,
    policy: QueuePolicy,
    wake: Arc<Notify>,
}

impl<S: QueueStore> QueueManager<S> {
    /// Load state from `store` and repair anything a crash could have left behind.
    pub fn open(store: S, policy: QueuePolicy) -> Result<Self, QueueError> {
        Self::open_with_audit(store, policy, None)
    }

    /// Same as [`QueueManager::open`], recording transitions to `audit`.
    pub fn open_with_audit(
        mut store: S,
        policy: QueuePolicy,
        audit: Option<Box<dyn AuditSink>>,
    ) -> Result<Self, QueueError> {
        let loaded = store.load()?;
        let fresh = loaded.is_none();
        let mut snapshot = loaded.unwrap_or_default();
        let mut repaired = snapshot.normalize();
        repaired |= demote_extra_running(&mut snapshot);
        if repaired {
            warn!("queue state needed repair on load; persisting corrected snapshot");
            store.save(&snapshot)?;
        }
        info!(
            experiments = snapshot.experiments.len(),
            queued = snapshot.queue_order.len(),
            fresh,
            "queue manager opened"
        );
        Ok(Self {
            inner: Mutex::new(Inner {
                snapshot,
                store,
                audit,
                poisoned: None,
            }),
            policy,
            wake: Arc::new(Notify::new()),
        })
    }

    /// Quota and retention in effect.
    pub const fn policy(&self) -> &QueuePolicy {
        &self.policy
    }

    /// Notified whenever something becomes dispatchable or a stop is requested.
    pub fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Whether mutations are refused after a failed durable write.
    pub fn is_persistence_locked(&self) -> bool {
        self.inner.lock().poisoned.is_some()
    }

    /// Retry persisting the in-memory state; on success mutations are accepted again.
    pub fn recover_persistence(&self) -> Result<(), QueueError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.poisoned.is_none() {
            return Ok(());
        }
        inner.store.save(&inner.snapshot)?;
        inner.poisoned = None;
        info!("queue persistence recovered; accepting mutations again");
        Ok(())
    }

    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut QueueSnapshot, &mut Vec<AuditEvent>) -> Result<T, QueueError>,
    ) -> Result<T, QueueError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Some(reason) = &inner.poisoned {
            return Err(QueueError::PersistenceLocked(reason.clone()));
        }
        let mut next = inner.snapshot.clone();
        let mut events = Vec::new();
        let out = f(&mut next, &mut events)?;
        // No events means nothing changed.
        if events.is_empty() {
            return Ok(out);
        }
        if let Err(err) = inner.store.save(&next) {
            error!(error = %err, "durable write failed; refusing further queue mutations");
            inner.poisoned = Some(err.to_string());
            return Err(QueueError::Persistence(err));
        }
        inner.snapshot = next;
        if let Some(sink) = inner.audit.as_mut() {
            for event in events {
                sink.record(event);
            }
        }
        Ok(out)
    }

    fn read<T>(&self, f: impl FnOnce(&QueueSnapshot) -> T) -> T {
        f(&self.inner.lock().snapshot)
    }

    /// Append a new experiment at the tail of the dispatch order.
    pub fn enqueue(
        &self,
        owner: impl Into<OwnerId>,
        payload: ExperimentPayload,
    ) -> Result<Enqueued, QueueError> {
        let owner = owner.into();
        if owner.trim().is_empty() {
            return Err(QueueError::Validation("owner id must not be empty".into()));
        }
        payload.validate()?;
        let limit = self.policy.max_active_per_owner;
        let enqueued = self.mutate(|snap, events| {
            let active = snap
                .experiments
                .values()
                .filter(|e| e.owner == owner && e.state.is_active())
                .count();
            if active >= limit {
                return Err(QueueError::QuotaExceeded {
                    owner: owner.clone(),
                    limit,
                });
            }
            let experiment = Experiment::new(owner.clone(), payload, now());
            let id = experiment.id.clone();
            snap.queue_order.push(id.clone());
            snap.experiments.insert(id.clone(), experiment);
            events.push(build_audit_event(id.as_str(), owner.as_str(), "enqueue", None));
            Ok(Enqueued {
                position: snap.queue_order.len() - 1,
                id,
            })
        })?;
        info!(experiment = %enqueued.id, owner = %owner, position = enqueued.position, "experiment queued");
        self.wake.notify_one();
        Ok(enqueued)
    }

    /// Dispatch the head of the queue, marking it RUNNING in the same critical section.
    ///
    /// Returns `None` when the queue is empty or an experiment is already RUNNING.
    pub fn next(&self) -> Result<Option<Experiment>, QueueError> {
        let dispatched = self.mutate(|snap, events| {
            if snap
                .experiments
                .values()
                .any(|e| e.state == ExperimentState::Running)
            {
                return Ok(None);
            }
            if snap.queue_order.is_empty() {
                return Ok(None);
            }
            let id = snap.queue_order.remove(0);
            let experiment = entry_mut(snap, &id)?;
            experiment.state = ExperimentState::Running;
            experiment.started_at = Some(now());
            experiment.cancel_requested = false;
            let out = experiment.clone();
            events.push(build_audit_event(id.as_str(), out.owner.as_str(), "dispatch", None));
            Ok(Some(out))
        })?;
        if let Some(experiment) = &dispatched {
            info!(experiment = %experiment.id, owner = %experiment.owner, "experiment dispatched");
        }
        Ok(dispatched)
    }

    /// RUNNING to COMPLETED. Returns `false` if the experiment already settled.
    pub fn complete(&self, id: &ExperimentId, exit_code: i32) -> Result<bool, QueueError> {
        let changed = self.settle(id, "complete", |e| {
            e.state = ExperimentState::Completed;
            e.exit_code = Some(exit_code);
            e.error = None;
        })?;
        if changed {
            info!(experiment = %id, exit_code, "experiment completed");
        }
        Ok(changed)
    }

    /// RUNNING to FAILED with a reason. Returns `false` if the experiment already settled.
    pub fn fail(
        &self,
        id: &ExperimentId,
        exit_code: Option<i32>,
        reason: impl Into<String>,
    ) -> Result<bool, QueueError> {
        let reason = reason.into();
        let changed = self.settle(id, "fail", |e| {
            e.state = ExperimentState::Failed;
            e.exit_code = exit_code;
            e.error = Some(reason.clone());
        })?;
        if changed {
            warn!(experiment = %id, ?exit_code, reason = %reason, "experiment failed");
        }
        Ok(changed)
    }

    /// RUNNING to CANCELLED once the sandbox acknowledged a stop.
    pub fn confirm_cancelled(&self, id: &ExperimentId) -> Result<bool, QueueError> {
        let changed = self.settle(id, "cancel", |e| {
            e.state = ExperimentState::Cancelled;
            e.error = Some("cancelled while running".into());
        })?;
        if changed {
            info!(experiment = %id, "running experiment cancelled");
        }
        Ok(changed)
    }

    fn settle(
        &self,
        id: &ExperimentId,
        action: &'static str,
        apply: impl FnOnce(&mut Experiment),
    ) -> Result<bool, QueueError> {
        self.mutate(|snap, events| {
            let experiment = entry_mut(snap, id)?;
            match experiment.state {
                ExperimentState::Running => {
                    apply(experiment);
                    experiment.finished_at = Some(now());
                    experiment.cancel_requested = false;
                    events.push(build_audit_event(
                        id.as_str(),
                        experiment.owner.as_str(),
                        action,
                        experiment.error.clone(),
                    ));
                    Ok(true)
                }
                state if state.is_terminal() => {
                    debug!(experiment = %id, %state, action, "duplicate completion signal ignored");
                    Ok(false)
                }
                state => Err(QueueError::transition(id, state, action)),
            }
        })
    }

    /// Cancel a QUEUED or PAUSED experiment immediately, or request a stop of a RUNNING one.
    pub fn cancel(&self, id: &ExperimentId) -> Result<CancelOutcome, QueueError> {
        let outcome = self.mutate(|snap, events| {
            let experiment = entry_mut(snap, id)?;
            match experiment.state {
                ExperimentState::Queued | ExperimentState::Paused => {
                    experiment.state = ExperimentState::Cancelled;
                    experiment.finished_at = Some(now());
                    events.push(build_audit_event(
                        id.as_str(),
                        experiment.owner.as_str(),
                        "cancel",
                        None,
                    ));
                    snap.queue_order.retain(|q| q != id);
                    Ok(CancelOutcome::Cancelled)
                }
                ExperimentState::Running => {
                    if !experiment.cancel_requested {
                        experiment.cancel_requested = true;
                        events.push(build_audit_event(
                            id.as_str(),
                            experiment.owner.as_str(),
                            "cancel_requested",
                            None,
                        ));
                    }
                    Ok(CancelOutcome::StopRequested)
                }
                state => Err(QueueError::transition(id, state, "cancel")),
            }
        })?;
        match outcome {
            CancelOutcome::Cancelled => info!(experiment = %id, "experiment cancelled"),
            CancelOutcome::StopRequested => {
                info!(experiment = %id, "stop requested for running experiment");
                self.wake.notify_one();
            }
        }
        Ok(outcome)
    }

    /// QUEUED to PAUSED; the experiment leaves the dispatch order.
    pub fn pause(&self, id: &ExperimentId) -> Result<(), QueueError> {
        self.mutate(|snap, events| {
            let experiment = entry_mut(snap, id)?;
            if experiment.state != ExperimentState::Queued {
                return Err(QueueError::transition(id, experiment.state, "pause"));
            }
            experiment.state = ExperimentState::Paused;
            events.push(build_audit_event(id.as_str(), experiment.owner.as_str(), "pause", None));
            snap.queue_order.retain(|q| q != id);
            Ok(())
        })?;
        info!(experiment = %id, "experiment paused");
        Ok(())
    }

    /// PAUSED to QUEUED at the tail of the dispatch order. Returns the new position.
    pub fn resume(&self, id: &ExperimentId) -> Result<usize, QueueError> {
        let position = self.mutate(|snap, events| {
            let experiment = entry_mut(snap, id)?;
            if experiment.state != ExperimentState::Paused {
                return Err(QueueError::transition(id, experiment.state, "resume"));
            }
            experiment.state = ExperimentState::Queued;
            events.push(build_audit_event(id.as_str(), experiment.owner.as_str(), "resume", None));
            snap.queue_order.push(id.clone());
            Ok(snap.queue_order.len() - 1)
        })?;
        info!(experiment = %id, position, "experiment resumed");
        self.wake.notify_one();
        Ok(position)
    }

    /// Move a QUEUED experiment to `new_position`, clamped to the tail. Returns the final position.
    pub fn reorder(&self, id: &ExperimentId, new_position: usize) -> Result<usize, QueueError> {
        let position = self.mutate(|snap, events| {
            let experiment = entry_mut(snap, id)?;
            if experiment.state != ExperimentState::Queued {
                return Err(QueueError::transition(id, experiment.state, "reorder"));
            }
            let owner = experiment.owner.clone();
            let current = snap
                .position_of(id)
                .ok_or_else(|| QueueError::transition(id, ExperimentState::Queued, "reorder"))?;
            let target = new_position.min(snap.queue_order.len() - 1);
            if target != current {
                let moved = snap.queue_order.remove(current);
                snap.queue_order.insert(target, moved);
                events.push(build_audit_event(
                    id.as_str(),
                    owner,
                    "reorder",
                    Some(format!("{current} -> {target}")),
                ));
            }
            Ok(target)
        })?;
        info!(experiment = %id, position, "experiment reordered");
        Ok(position)
    }

    /// Put a QUEUED or PAUSED experiment at the head of the dispatch order.
    pub fn run_now(&self, id: &ExperimentId) -> Result<(), QueueError> {
        self.mutate(|snap, events| {
            let experiment = entry_mut(snap, id)?;
            match experiment.state {
                ExperimentState::Queued | ExperimentState::Paused => {
                    experiment.state = ExperimentState::Queued;
                    events.push(build_audit_event(
                        id.as_str(),
                        experiment.owner.as_str(),
                        "run_now",
                        None,
                    ));
                    snap.queue_order.retain(|q| q != id);
                    snap.queue_order.insert(0, id.clone());
                    Ok(())
                }
                state => Err(QueueError::transition(id, state, "run now")),
            }
        })?;
        info!(experiment = %id, "experiment moved to head of queue");
        self.wake.notify_one();
        Ok(())
    }

    /// Remove terminal experiments that finished before `now - retention`.
    pub fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let retention = chrono::Duration::from_std(self.policy.retention)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let Some(cutoff) = now.checked_sub_signed(retention) else {
            return Ok(0);
        };
        let removed = self.mutate(|snap, events| {
            let expired: Vec<ExperimentId> = snap
                .experiments
                .values()
                .filter(|e| e.state.is_terminal() && e.finished_at.unwrap_or(e.created_at) < cutoff)
                .map(|e| e.id.clone())
                .collect();
            for id in &expired {
                if let Some(e) = snap.experiments.remove(id) {
                    events.push(build_audit_event(id.as_str(), e.owner, "cleanup", None));
                }
            }
            Ok(expired.len())
        })?;
        if removed > 0 {
            info!(removed, "expired experiments swept");
        }
        Ok(removed)
    }

    /// Fail every RUNNING experiment for which `is_live` reports no sandbox.
    pub fn reconcile_running(
        &self,
        mut is_live: impl FnMut(&ExperimentId) -> bool,
    ) -> Result<Vec<ExperimentId>, QueueError> {
        let orphaned = self.mutate(|snap, events| {
            let mut orphaned = Vec::new();
            for experiment in snap.experiments.values_mut() {
                if experiment.state == ExperimentState::Running && !is_live(&experiment.id) {
                    experiment.state = ExperimentState::Failed;
                    experiment.finished_at = Some(now());
                    experiment.error = Some(ORPHANED_REASON.into());
                    experiment.cancel_requested = false;
                    events.push(build_audit_event(
                        experiment.id.as_str(),
                        experiment.owner.as_str(),
                        "reconcile",
                        Some(ORPHANED_REASON.into()),
                    ));
                    orphaned.push(experiment.id.clone());
                }
            }
            Ok(orphaned)
        })?;
        for id in &orphaned {
            warn!(experiment = %id, "running experiment had no live sandbox; marked failed");
        }
        Ok(orphaned)
    }

    /// Full record of one experiment.
    pub fn get(&self, id: &ExperimentId) -> Option<Experiment> {
        self.read(|snap| snap.experiments.get(id).cloned())
    }

    /// Status view of one experiment.
    pub fn status(&self, id: &ExperimentId) -> Result<ExperimentStatus, QueueError> {
        self.read(|snap| {
            snap.experiments
                .get(id)
                .map(|e| status_of(snap, e))
                .ok_or_else(|| QueueError::NotFound(id.clone()))
        })
    }

    /// The RUNNING experiment, if any.
    pub fn running(&self) -> Option<Experiment> {
        self.read(|snap| {
            snap.experiments
                .values()
                .find(|e| e.state == ExperimentState::Running)
                .cloned()
        })
    }

    /// Active experiments: running first, then queued by position, then paused by age.
    pub fn list_queue(&self) -> Vec<QueueEntry> {
        self.read(active_entries)
    }

    /// Every experiment of one owner, newest first.
    pub fn list_for_owner(&self, owner: &str) -> Vec<ExperimentStatus> {
        self.read(|snap| {
            let mut mine: Vec<&Experiment> =
                snap.experiments.values().filter(|e| e.owner == owner).collect();
            mine.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            mine.into_iter().map(|e| status_of(snap, e)).collect()
        })
    }

    /// Counts, estimated wait and the active listing.
    pub fn summary(&self) -> QueueSummary {
        self.read(|snap| {
            let entries = active_entries(snap);
            let count = |state| entries.iter().filter(|e| e.state == state).count();
            let queued = count(ExperimentState::Queued);
            QueueSummary {
                queued,
                running: count(ExperimentState::Running),
                paused: count(ExperimentState::Paused),
                estimated_wait_minutes: queued as u64 * ESTIMATED_MINUTES_PER_EXPERIMENT,
                entries,
            }
        })
    }

    /// Copy of the full in-memory state.
    pub fn snapshot(&self) -> QueueSnapshot {
        self.read(|snap| snap.clone())
    }
}

fn entry_mut<'a>(
    snap: &'a mut QueueSnapshot,
    id: &ExperimentId,
) -> Result<&'a mut Experiment, QueueError> {
    snap.experiments
        .get_mut(id)
        .ok_or_else(|| QueueError::NotFound(id.clone()))
}

fn status_of(snap: &QueueSnapshot, e: &Experiment) -> ExperimentStatus {
    ExperimentStatus {
        id: e.id.clone(),
        owner: e.owner.clone(),
        state: e.state,
        queue_position: snap.position_of(&e.id),
        created_at: e.created_at,
        started_at: e.started_at,
        finished_at: e.finished_at,
        exit_code: e.exit_code,
        error: e.error.clone(),
    }
}

fn entry_of(e: &Experiment, queue_position: Option<usize>) -> QueueEntry {
    QueueEntry {
        experiment_id: e.id.clone(),
        owner_id: e.owner.clone(),
        state: e.state,
        queue_position,
    }
}

fn active_entries(snap: &QueueSnapshot) -> Vec<QueueEntry> {
    let mut entries: Vec<QueueEntry> = snap
        .experiments
        .values()
        .filter(|e| e.state == ExperimentState::Running)
        .map(|e| entry_of(e, None))
        .collect();
    entries.extend(
        snap.queue_order
            .iter()
            .enumerate()
            .filter_map(|(pos, id)| snap.experiments.get(id).map(|e| entry_of(e, Some(pos)))),
    );
    let mut paused: Vec<&Experiment> = snap
        .experiments
        .values()
        .filter(|e| e.state == ExperimentState::Paused)
        .collect();
    paused.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    entries.extend(paused.into_iter().map(|e| entry_of(e, None)));
    entries
}

/// Keep the earliest-started RUNNING experiment; fail the rest.
fn demote_extra_running(snap: &mut QueueSnapshot) -> bool {
    let mut running: Vec<(Option<DateTime<Utc>>, ExperimentId)> = snap
        .experiments
        .values()
        .filter(|e| e.state == ExperimentState::Running)
        .map(|e| (e.started_at, e.id.clone()))
        .collect();
    if running.len() <= 1 {
        return false;
    }
    running.sort();
    for (_, id) in running.into_iter().skip(1) {
        if let Some(e) = snap.experiments.get_mut(&id) {
            warn!(experiment = %id, "more than one running experiment on load; failing extra");
            e.state = ExperimentState::Failed;
            e.finished_at = Some(now());
            e.error = Some("multiple running experiments found on load".into());
        }
    }
    true
}
