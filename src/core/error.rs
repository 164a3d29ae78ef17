//! Error types for queue and dispatch operations.

use thiserror::Error;

use crate::core::experiment::ExperimentState;
use crate::core::store::StoreError;
use crate::util::ExperimentId;

/// Errors produced by the queue state machine.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Payload or owner failed validation; nothing was created.
    #[error("validation error: {0}")]
    Validation(String),
    /// Owner already has the maximum number of active experiments.
    #[error("quota exceeded: owner `{owner}` already has {limit} active experiments")]
    QuotaExceeded {
        /// Offending owner.
        owner: String,
        /// Configured per-owner cap.
        limit: usize,
    },
    /// Unknown experiment identifier.
    #[error("experiment not found: {0}")]
    NotFound(ExperimentId),
    /// Operation is not legal for the experiment's current state.
    #[error("cannot {action} experiment {id} in state {state}")]
    InvalidStateTransition {
        /// Target experiment.
        id: ExperimentId,
        /// State at the time of the call.
        state: ExperimentState,
        /// Attempted operation.
        action: &'static str,
    },
    /// A durable write failed; the mutation was not applied.
    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),
    /// An earlier durable write failed and mutations are refused until recovery.
    #[error("queue is read-only after a persistence failure: {0}")]
    PersistenceLocked(String),
}

impl QueueError {
    pub(crate) fn transition(
        id: &ExperimentId,
        state: ExperimentState,
        action: &'static str,
    ) -> Self {
        Self::InvalidStateTransition {
            id: id.clone(),
            state,
            action,
        }
    }
}

/// Errors crossing the orchestrator/execution-host boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Transient communication failure (timeout, transport error). Retryable.
    #[error("dispatch failure: {0}")]
    DispatchFailure(String),
    /// The execution host refused the request.
    #[error("rejected by execution host: {0}")]
    Rejected(String),
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
