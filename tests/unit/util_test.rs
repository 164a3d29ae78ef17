//! Tests for utility functions

use reactorlab::util::{now, now_ms, ExperimentId};

#[test]
fn test_experiment_ids_are_unique() {
    let a = ExperimentId::new();
    let b = ExperimentId::new();
    assert_ne!(a, b);
    assert!(!a.as_str().is_empty());
}

#[test]
fn test_experiment_id_serializes_as_plain_string() {
    let id = ExperimentId::from("exp-42");
    assert_eq!(serde_json::to_string(&id).unwrap(), "\"exp-42\"");
    let back: ExperimentId = serde_json::from_str("\"exp-42\"").unwrap();
    assert_eq!(back, id);
    assert_eq!(id.to_string(), "exp-42");
}

#[test]
fn test_clock_is_consistent() {
    let ms = now_ms();
    let wall = u128::try_from(now().timestamp_millis()).unwrap();
    assert!(wall + 1_000 >= ms);
}

#[test]
fn test_init_tracing_is_idempotent() {
    reactorlab::util::init_tracing();
    reactorlab::util::init_tracing();
    tracing::info!("tracing installed");
}
