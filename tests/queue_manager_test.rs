//! Integration tests for the durable experiment queue.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use reactorlab::core::queue_manager::ORPHANED_REASON;
use reactorlab::core::{
    CancelOutcome, ExperimentPayload, ExperimentState, InMemoryAuditSink, QueueError,
    QueueManager, QueuePolicy,
};
use reactorlab::infra::InMemoryStore;
use reactorlab::util::{now, ExperimentId};

fn payload(n: u32) -> ExperimentPayload {
    ExperimentPayload::new(format!("print({n})"))
}

fn manager(store: InMemoryStore) -> QueueManager<InMemoryStore> {
    QueueManager::open(store, QueuePolicy::default()).unwrap()
}

fn positions(qm: &QueueManager<InMemoryStore>) -> Vec<(ExperimentId, Option<usize>)> {
    qm.list_queue()
        .into_iter()
        .map(|e| (e.experiment_id, e.queue_position))
        .collect()
}

#[test]
fn test_fifo_dispatch_with_reorder() {
    let qm = manager(InMemoryStore::new());
    let a = qm.enqueue("alice", payload(1)).unwrap();
    let b = qm.enqueue("bob", payload(2)).unwrap();
    let c = qm.enqueue("carol", payload(3)).unwrap();
    assert_eq!((a.position, b.position, c.position), (0, 1, 2));

    assert_eq!(qm.reorder(&c.id, 0).unwrap(), 0);
    assert_eq!(
        positions(&qm),
        vec![
            (c.id.clone(), Some(0)),
            (a.id.clone(), Some(1)),
            (b.id.clone(), Some(2))
        ]
    );

    let first = qm.next().unwrap().unwrap();
    assert_eq!(first.id, c.id);
    assert!(qm.next().unwrap().is_none(), "only one experiment may run");
    assert!(qm.complete(&c.id, 0).unwrap());

    assert_eq!(qm.next().unwrap().unwrap().id, a.id);
    assert!(qm.fail(&a.id, Some(1), "boom").unwrap());
    assert_eq!(qm.next().unwrap().unwrap().id, b.id);

    let a_status = qm.status(&a.id).unwrap();
    assert_eq!(a_status.state, ExperimentState::Failed);
    assert_eq!(a_status.exit_code, Some(1));
    assert_eq!(a_status.error.as_deref(), Some("boom"));
    assert!(a_status.finished_at.is_some());
}

#[test]
fn test_quota_counts_active_experiments_only() {
    let qm = manager(InMemoryStore::new());
    let mut ids = Vec::new();
    for n in 0..5 {
        ids.push(qm.enqueue("alice", payload(n)).unwrap().id);
    }
    let err = qm.enqueue("alice", payload(6)).unwrap_err();
    assert!(matches!(err, QueueError::QuotaExceeded { limit: 5, .. }));
    assert_eq!(qm.list_for_owner("alice").len(), 5);

    // Paused experiments still count.
    qm.pause(&ids[0]).unwrap();
    assert!(qm.enqueue("alice", payload(7)).is_err());

    // Terminal experiments do not.
    assert_eq!(qm.cancel(&ids[0]).unwrap(), CancelOutcome::Cancelled);
    assert!(qm.enqueue("alice", payload(8)).is_ok());

    // Other owners are unaffected.
    assert!(qm.enqueue("bob", payload(9)).is_ok());
}

#[test]
fn test_validation_creates_nothing() {
    let store = InMemoryStore::new();
    let qm = manager(store.clone());
    assert!(matches!(
        qm.enqueue("alice", ExperimentPayload::new("")),
        Err(QueueError::Validation(_))
    ));
    assert!(matches!(
        qm.enqueue("  ", payload(1)),
        Err(QueueError::Validation(_))
    ));
    assert!(qm.list_queue().is_empty());
    assert_eq!(store.save_count(), 0);
}

#[test]
fn test_pause_resume_appends_to_tail() {
    let qm = manager(InMemoryStore::new());
    let a = qm.enqueue("alice", payload(1)).unwrap();
    let b = qm.enqueue("alice", payload(2)).unwrap();
    let c = qm.enqueue("alice", payload(3)).unwrap();

    qm.pause(&a.id).unwrap();
    assert_eq!(qm.status(&a.id).unwrap().queue_position, None);
    assert_eq!(qm.status(&b.id).unwrap().queue_position, Some(0));
    assert_eq!(qm.status(&c.id).unwrap().queue_position, Some(1));

    assert_eq!(qm.resume(&a.id).unwrap(), 2);
    assert_eq!(qm.status(&a.id).unwrap().state, ExperimentState::Queued);
    assert!(matches!(
        qm.resume(&a.id),
        Err(QueueError::InvalidStateTransition { .. })
    ));
}

#[test]
fn test_run_now_moves_paused_to_head() {
    let qm = manager(InMemoryStore::new());
    let a = qm.enqueue("alice", payload(1)).unwrap();
    let b = qm.enqueue("bob", payload(2)).unwrap();
    qm.pause(&b.id).unwrap();
    qm.run_now(&b.id).unwrap();
    assert_eq!(qm.status(&b.id).unwrap().queue_position, Some(0));
    assert_eq!(qm.status(&a.id).unwrap().queue_position, Some(1));
    assert_eq!(qm.next().unwrap().unwrap().id, b.id);
}

#[test]
fn test_illegal_transitions_are_rejected() {
    let qm = manager(InMemoryStore::new());
    let a = qm.enqueue("alice", payload(1)).unwrap();
    qm.next().unwrap();

    assert!(matches!(
        qm.pause(&a.id),
        Err(QueueError::InvalidStateTransition { .. })
    ));
    assert!(matches!(
        qm.reorder(&a.id, 0),
        Err(QueueError::InvalidStateTransition { .. })
    ));
    qm.complete(&a.id, 0).unwrap();
    assert!(matches!(
        qm.cancel(&a.id),
        Err(QueueError::InvalidStateTransition { .. })
    ));
    assert!(matches!(
        qm.status(&ExperimentId::from("nope")),
        Err(QueueError::NotFound(_))
    ));

    let b = qm.enqueue("alice", payload(2)).unwrap();
    assert!(matches!(
        qm.complete(&b.id, 0),
        Err(QueueError::InvalidStateTransition { .. })
    ));
}

#[test]
fn test_cancel_running_is_settled_once() {
    let qm = manager(InMemoryStore::new());
    let a = qm.enqueue("alice", payload(1)).unwrap();
    qm.next().unwrap();

    assert_eq!(qm.cancel(&a.id).unwrap(), CancelOutcome::StopRequested);
    assert_eq!(qm.cancel(&a.id).unwrap(), CancelOutcome::StopRequested);
    assert_eq!(qm.status(&a.id).unwrap().state, ExperimentState::Running);

    assert!(qm.confirm_cancelled(&a.id).unwrap());
    assert!(!qm.complete(&a.id, 0).unwrap());
    assert_eq!(qm.status(&a.id).unwrap().state, ExperimentState::Cancelled);
}

#[test]
fn test_failed_write_locks_until_recovered() {
    let store = InMemoryStore::new();
    let qm = manager(store.clone());
    let a = qm.enqueue("alice", payload(1)).unwrap();

    store.set_fail_writes(true);
    assert!(matches!(
        qm.enqueue("alice", payload(2)),
        Err(QueueError::Persistence(_))
    ));
    assert!(qm.is_persistence_locked());
    // Memory was not changed by the failed write.
    assert_eq!(qm.list_queue().len(), 1);
    assert!(matches!(
        qm.pause(&a.id),
        Err(QueueError::PersistenceLocked(_))
    ));
    // Reads keep working.
    assert_eq!(qm.status(&a.id).unwrap().queue_position, Some(0));

    assert!(qm.recover_persistence().is_err());
    store.set_fail_writes(false);
    qm.recover_persistence().unwrap();
    assert!(!qm.is_persistence_locked());
    qm.pause(&a.id).unwrap();
}

#[test]
fn test_restart_restores_order_and_reconciles_running() {
    let store = InMemoryStore::new();
    let (running, queued) = {
        let qm = manager(store.clone());
        let a = qm.enqueue("alice", payload(1)).unwrap();
        let b = qm.enqueue("bob", payload(2)).unwrap();
        let c = qm.enqueue("carol", payload(3)).unwrap();
        qm.reorder(&c.id, 1).unwrap();
        qm.next().unwrap();
        (a.id, vec![c.id, b.id])
    };

    let qm = manager(store);
    assert_eq!(qm.running().unwrap().id, running);
    let order: Vec<ExperimentId> = qm
        .list_queue()
        .into_iter()
        .filter(|e| e.state == ExperimentState::Queued)
        .map(|e| e.experiment_id)
        .collect();
    assert_eq!(order, queued);

    let orphaned = qm.reconcile_running(|_| false).unwrap();
    assert_eq!(orphaned, vec![running.clone()]);
    let status = qm.status(&running).unwrap();
    assert_eq!(status.state, ExperimentState::Failed);
    assert_eq!(status.error.as_deref(), Some(ORPHANED_REASON));
    assert!(qm.reconcile_running(|_| false).unwrap().is_empty());
}

#[test]
fn test_load_repairs_corrupted_ordering() {
    let store = InMemoryStore::new();
    {
        let qm = manager(store.clone());
        qm.enqueue("alice", payload(1)).unwrap();
        qm.enqueue("alice", payload(2)).unwrap();
        qm.enqueue("alice", payload(3)).unwrap();
    }
    let mut snapshot = store.saved().unwrap();
    let ids: Vec<ExperimentId> = snapshot.experiments.keys().cloned().collect();
    // Two RUNNING records plus a broken order.
    for id in &ids[..2] {
        let e = snapshot.experiments.get_mut(id).unwrap();
        e.state = ExperimentState::Running;
        e.started_at = Some(now());
    }
    snapshot.queue_order = vec![ids[0].clone(), ExperimentId::from("ghost")];

    let repaired = InMemoryStore::with_snapshot(snapshot);
    let qm = manager(repaired.clone());
    let summary = qm.summary();
    assert_eq!(summary.running, 1);
    assert_eq!(summary.queued, 1);
    assert_eq!(qm.status(&ids[2]).unwrap().queue_position, Some(0));
    assert_eq!(repaired.save_count(), 1, "repair is persisted");
}

#[test]
fn test_cleanup_expired_keeps_active_and_recent() {
    let policy = QueuePolicy {
        retention: Duration::from_secs(60 * 60),
        ..QueuePolicy::default()
    };
    let qm = QueueManager::open(InMemoryStore::new(), policy).unwrap();
    let done = qm.enqueue("alice", payload(1)).unwrap();
    qm.next().unwrap();
    qm.complete(&done.id, 0).unwrap();
    let cancelled = qm.enqueue("alice", payload(2)).unwrap();
    qm.cancel(&cancelled.id).unwrap();
    let waiting = qm.enqueue("alice", payload(3)).unwrap();

    assert_eq!(qm.cleanup_expired(now()).unwrap(), 0);
    let later = now() + ChronoDuration::hours(2);
    assert_eq!(qm.cleanup_expired(later).unwrap(), 2);
    assert!(qm.get(&done.id).is_none());
    assert!(qm.get(&cancelled.id).is_none());
    assert_eq!(qm.status(&waiting.id).unwrap().queue_position, Some(0));
}

#[test]
fn test_list_for_owner_newest_first() {
    let qm = manager(InMemoryStore::new());
    let first = qm.enqueue("alice", payload(1)).unwrap();
    std::thread::sleep(Duration::from_millis(5));
    let second = qm.enqueue("alice", payload(2)).unwrap();
    qm.enqueue("bob", payload(3)).unwrap();

    let mine: Vec<ExperimentId> = qm
        .list_for_owner("alice")
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(mine, vec![second.id, first.id]);
    assert!(qm.list_for_owner("nobody").is_empty());
}

#[test]
fn test_audit_trail_records_transitions() {
    let audit = InMemoryAuditSink::new(100);
    let qm = QueueManager::open_with_audit(
        InMemoryStore::new(),
        QueuePolicy::default(),
        Some(Box::new(audit.clone())),
    )
    .unwrap();
    let a = qm.enqueue("alice", payload(1)).unwrap();
    qm.next().unwrap();
    qm.cancel(&a.id).unwrap();
    qm.confirm_cancelled(&a.id).unwrap();
    // Rejected and no-op calls leave no trace.
    let _ = qm.pause(&a.id);
    let _ = qm.complete(&a.id, 0);

    assert_eq!(
        audit.actions_for(a.id.as_str()),
        vec!["enqueue", "dispatch", "cancel_requested", "cancel"]
    );
}

#[test]
fn test_noop_reorder_skips_write() {
    let store = InMemoryStore::new();
    let qm = manager(store.clone());
    let a = qm.enqueue("alice", payload(1)).unwrap();
    let saves = store.save_count();
    assert_eq!(qm.reorder(&a.id, 0).unwrap(), 0);
    assert_eq!(store.save_count(), saves);
}

#[tokio::test]
async fn test_enqueue_wakes_waiters() {
    let qm = manager(InMemoryStore::new());
    let wake = qm.wake_handle();
    let notified = wake.notified();
    qm.enqueue("alice", payload(1)).unwrap();
    tokio::time::timeout(Duration::from_secs(1), notified)
        .await
        .unwrap();
}

#[test]
fn test_concurrent_callers_never_double_dispatch() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 50;

    let qm = Arc::new(manager(InMemoryStore::new()));
    let seeded: Arc<Vec<ExperimentId>> = Arc::new(
        (0..20)
            .map(|i| qm.enqueue(format!("seed-{i}"), payload(i)).unwrap().id)
            .collect(),
    );
    let barrier = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let qm = Arc::clone(&qm);
            let seeded = Arc::clone(&seeded);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut dispatched = Vec::new();
                for i in 0..ROUNDS {
                    if let Some(experiment) = qm.next().unwrap() {
                        dispatched.push(experiment.id);
                    }
                    let target = &seeded[(t * 7 + i) % seeded.len()];
                    match i % 3 {
                        0 => {
                            let _ = qm.cancel(target);
                        }
                        1 => {
                            let _ = qm.reorder(target, i % 5);
                        }
                        _ => {
                            let n = u32::try_from(i).unwrap();
                            let _ = qm.enqueue(format!("worker-{t}"), payload(n));
                        }
                    }
                }
                dispatched
            })
        })
        .collect();
    let dispatched: Vec<ExperimentId> = workers
        .into_iter()
        .flat_map(|w| w.join().unwrap())
        .collect();

    // Nothing completes, so exactly one call may have won the dispatch.
    assert_eq!(dispatched.len(), 1, "{dispatched:?}");
    assert_eq!(qm.status(&dispatched[0]).unwrap().state, ExperimentState::Running);
    assert_eq!(qm.running().map(|e| e.id), Some(dispatched[0].clone()));

    let entries = qm.list_queue();
    let running = entries
        .iter()
        .filter(|e| e.state == ExperimentState::Running)
        .count();
    assert_eq!(running, 1);
    let queued: Vec<usize> = entries
        .iter()
        .filter(|e| e.state == ExperimentState::Queued)
        .map(|e| e.queue_position.unwrap())
        .collect();
    assert_eq!(queued, (0..queued.len()).collect::<Vec<_>>());
    assert!(
        entries
            .iter()
            .filter(|e| e.state != ExperimentState::Queued)
            .all(|e| e.queue_position.is_none())
    );
}
