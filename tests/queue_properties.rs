//! Property tests: arbitrary control sequences never break queue invariants.

use std::collections::{HashMap, HashSet};

use proptest::prelude::*;
use reactorlab::core::{ExperimentPayload, ExperimentState, QueueManager, QueuePolicy};
use reactorlab::infra::InMemoryStore;
use reactorlab::util::ExperimentId;

const OWNERS: [&str; 3] = ["alice", "bob", "carol"];
const QUOTA: usize = 3;

#[derive(Debug, Clone)]
enum Op {
    Enqueue(usize),
    Next,
    Complete,
    Fail,
    Cancel(usize),
    ConfirmCancelled,
    Pause(usize),
    Resume(usize),
    Reorder(usize, usize),
    RunNow(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..OWNERS.len()).prop_map(Op::Enqueue),
        2 => Just(Op::Next),
        1 => Just(Op::Complete),
        1 => Just(Op::Fail),
        1 => any::<usize>().prop_map(Op::Cancel),
        1 => Just(Op::ConfirmCancelled),
        1 => any::<usize>().prop_map(Op::Pause),
        1 => any::<usize>().prop_map(Op::Resume),
        1 => (any::<usize>(), 0usize..8).prop_map(|(i, p)| Op::Reorder(i, p)),
        1 => any::<usize>().prop_map(Op::RunNow),
    ]
}

fn pick(ids: &[ExperimentId], i: usize) -> Option<&ExperimentId> {
    if ids.is_empty() {
        None
    } else {
        ids.get(i % ids.len())
    }
}

fn apply(qm: &QueueManager<InMemoryStore>, ids: &mut Vec<ExperimentId>, op: Op) {
    // Individual calls may legitimately fail; only the invariants matter.
    match op {
        Op::Enqueue(owner) => {
            if let Ok(e) = qm.enqueue(OWNERS[owner], ExperimentPayload::new("print(1)")) {
                ids.push(e.id);
            }
        }
        Op::Next => {
            let _ = qm.next();
        }
        Op::Complete => {
            if let Some(e) = qm.running() {
                let _ = qm.complete(&e.id, 0);
            }
        }
        Op::Fail => {
            if let Some(e) = qm.running() {
                let _ = qm.fail(&e.id, Some(1), "crash");
            }
        }
        Op::ConfirmCancelled => {
            if let Some(e) = qm.running().filter(|e| e.cancel_requested) {
                let _ = qm.confirm_cancelled(&e.id);
            }
        }
        Op::Cancel(i) => {
            if let Some(id) = pick(ids, i) {
                let _ = qm.cancel(id);
            }
        }
        Op::Pause(i) => {
            if let Some(id) = pick(ids, i) {
                let _ = qm.pause(id);
            }
        }
        Op::Resume(i) => {
            if let Some(id) = pick(ids, i) {
                let _ = qm.resume(id);
            }
        }
        Op::Reorder(i, pos) => {
            if let Some(id) = pick(ids, i) {
                let _ = qm.reorder(id, pos);
            }
        }
        Op::RunNow(i) => {
            if let Some(id) = pick(ids, i) {
                let _ = qm.run_now(id);
            }
        }
    }
}

fn check_invariants(qm: &QueueManager<InMemoryStore>) -> Result<(), TestCaseError> {
    let snap = qm.snapshot();
    let running = snap
        .experiments
        .values()
        .filter(|e| e.state == ExperimentState::Running)
        .count();
    prop_assert!(running <= 1, "{running} experiments running");

    let mut seen = HashSet::new();
    for id in &snap.queue_order {
        prop_assert!(seen.insert(id.clone()), "duplicate {id} in order");
        prop_assert_eq!(snap.experiments[id].state, ExperimentState::Queued);
    }
    let queued = snap
        .experiments
        .values()
        .filter(|e| e.state == ExperimentState::Queued)
        .count();
    prop_assert_eq!(queued, snap.queue_order.len());

    let listed: Vec<usize> = qm
        .list_queue()
        .into_iter()
        .filter_map(|e| e.queue_position)
        .collect();
    prop_assert_eq!(listed, (0..queued).collect::<Vec<_>>());

    let mut active: HashMap<&str, usize> = HashMap::new();
    for e in snap.experiments.values().filter(|e| e.state.is_active()) {
        *active.entry(e.owner.as_str()).or_default() += 1;
    }
    for (owner, count) in active {
        prop_assert!(count <= QUOTA, "{owner} has {count} active");
    }
    for e in snap.experiments.values() {
        prop_assert_eq!(e.state.is_terminal(), e.finished_at.is_some());
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn invariants_hold_after_any_sequence(ops in prop::collection::vec(op(), 1..60)) {
        let store = InMemoryStore::new();
        let policy = QueuePolicy { max_active_per_owner: QUOTA, ..QueuePolicy::default() };
        let qm = QueueManager::open(store.clone(), policy.clone()).unwrap();
        let mut ids = Vec::new();
        for op in ops {
            apply(&qm, &mut ids, op);
            check_invariants(&qm)?;
        }

        // A restart sees exactly the committed state.
        let before = qm.snapshot();
        drop(qm);
        let reopened = QueueManager::open(store, policy).unwrap();
        prop_assert_eq!(reopened.snapshot(), before);
    }
}
