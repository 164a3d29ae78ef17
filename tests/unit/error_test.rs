//! Tests for error types

use reactorlab::core::{DispatchError, ExperimentState, QueueError, StoreError};
use reactorlab::runtime::ApiError;
use reactorlab::util::ExperimentId;

#[test]
fn test_quota_exceeded_error() {
    let err = QueueError::QuotaExceeded {
        owner: "alice".to_string(),
        limit: 5,
    };
    assert_eq!(
        format!("{err}"),
        "quota exceeded: owner `alice` already has 5 active experiments"
    );
}

#[test]
fn test_not_found_error() {
    let err = QueueError::NotFound(ExperimentId::from("exp-1"));
    assert_eq!(format!("{err}"), "experiment not found: exp-1");
}

#[test]
fn test_invalid_transition_error() {
    let err = QueueError::InvalidStateTransition {
        id: ExperimentId::from("exp-1"),
        state: ExperimentState::Completed,
        action: "pause",
    };
    assert_eq!(
        format!("{err}"),
        "cannot pause experiment exp-1 in state completed"
    );
}

#[test]
fn test_store_error_converts_to_persistence() {
    let err: QueueError = StoreError::Unavailable("disk gone".to_string()).into();
    assert!(matches!(err, QueueError::Persistence(_)));
    assert_eq!(ApiError::from(err).http_status(), 503);
}

#[test]
fn test_dispatch_error_messages() {
    let err = DispatchError::DispatchFailure("timeout".to_string());
    assert_eq!(format!("{err}"), "dispatch failure: timeout");
    let err = DispatchError::Rejected("busy".to_string());
    assert_eq!(format!("{err}"), "rejected by execution host: busy");
}

#[test]
fn test_api_error_codes() {
    let cases = [
        (QueueError::Validation("x".into()), "validation_error", 400),
        (
            QueueError::QuotaExceeded {
                owner: "a".into(),
                limit: 1,
            },
            "quota_exceeded",
            429,
        ),
        (
            QueueError::NotFound(ExperimentId::from("e")),
            "not_found",
            404,
        ),
        (
            QueueError::PersistenceLocked("earlier failure".into()),
            "persistence_error",
            503,
        ),
    ];
    for (err, code, status) in cases {
        let api = ApiError::from(err);
        assert_eq!(api.code, code);
        assert_eq!(api.http_status(), status);
    }
}
