//! Tests for audit sink

use reactorlab::core::{build_audit_event, AuditSink, InMemoryAuditSink};

#[test]
fn test_in_memory_audit_sink() {
    let mut sink = InMemoryAuditSink::new(10);

    let event = build_audit_event("exp1", "alice", "enqueue", Some("detail".to_string()));
    sink.record(event.clone());
    assert_eq!(sink.events().len(), 1);

    let events = sink.events();
    assert_eq!(events[0].event_id, event.event_id);
    assert_eq!(events[0].experiment_id, "exp1");
    assert_eq!(events[0].owner, "alice");
    assert_eq!(events[0].action, "enqueue");
    assert_eq!(events[0].detail.as_deref(), Some("detail"));
}

#[test]
fn test_audit_sink_overflow() {
    let mut sink = InMemoryAuditSink::new(2);

    sink.record(build_audit_event("exp1", "alice", "enqueue", None));
    sink.record(build_audit_event("exp2", "alice", "enqueue", None));
    sink.record(build_audit_event("exp3", "alice", "enqueue", None));

    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].experiment_id, "exp2"); // First one popped
    assert_eq!(events[1].experiment_id, "exp3");
}

#[test]
fn test_clones_share_buffer() {
    let sink = InMemoryAuditSink::new(8);
    let mut writer = sink.clone();
    writer.record(build_audit_event("exp1", "alice", "enqueue", None));
    writer.record(build_audit_event("exp1", "alice", "dispatch", None));
    writer.record(build_audit_event("exp2", "bob", "enqueue", None));
    assert_eq!(sink.actions_for("exp1"), vec!["enqueue", "dispatch"]);
}

#[test]
fn test_event_ids_are_unique() {
    let a = build_audit_event("exp1", "alice", "enqueue", None);
    let b = build_audit_event("exp1", "alice", "enqueue", None);
    assert_ne!(a.event_id, b.event_id);
}
