//! Queue API request/response models and handlers.
//!
//! Transport-agnostic: an HTTP layer deserializes into these types, calls
//! [`QueueApi`], and uses [`ApiError::http_status`] for the response code.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::{
    CancelOutcome, ExperimentPayload, ExperimentStatus, QueueEntry, QueueError, QueueManager,
    QueueStore, QueueSummary,
};
use crate::util::{ExperimentId, OwnerId};

/// Enqueue request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    /// Submitting owner.
    pub owner_id: OwnerId,
    /// Script and metadata.
    pub payload: ExperimentPayload,
}

/// Enqueue response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueResponse {
    /// New experiment id.
    pub experiment_id: ExperimentId,
    /// Zero-based queue position.
    pub queue_position: usize,
}

/// Queue control commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlCommand {
    /// Cancel (or request a stop of) an experiment.
    Cancel {
        /// Target.
        experiment_id: ExperimentId,
    },
    /// Hold a queued experiment.
    Pause {
        /// Target.
        experiment_id: ExperimentId,
    },
    /// Return a paused experiment to the tail.
    Resume {
        /// Target.
        experiment_id: ExperimentId,
    },
    /// Move a queued experiment.
    Reorder {
        /// Target.
        experiment_id: ExperimentId,
        /// Requested zero-based position.
        new_position: usize,
    },
    /// Move to the head of the queue.
    RunNow {
        /// Target.
        experiment_id: ExperimentId,
    },
}

/// Result of a control command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlResponse {
    /// Target.
    pub experiment_id: ExperimentId,
    /// Cancel outcome, for cancel commands.
    pub cancel: Option<CancelOutcome>,
    /// Position after the command, when the experiment is queued.
    pub queue_position: Option<usize>,
}

/// Health response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    /// Healthy flag.
    pub ok: bool,
    /// Mutations refused after a failed durable write.
    pub persistence_locked: bool,
    /// Experiment currently running.
    pub running: Option<ExperimentId>,
}

/// Error body plus transport status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    /// Stable machine-readable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl ApiError {
    /// HTTP status a transport should answer with.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self.code.as_str() {
            "validation_error" => 400,
            "not_found" => 404,
            "invalid_state_transition" => 409,
            "quota_exceeded" => 429,
            "persistence_error" => 503,
            _ => 500,
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        let code = match &err {
            QueueError::Validation(_) => "validation_error",
            QueueError::QuotaExceeded { .. } => "quota_exceeded",
            QueueError::NotFound(_) => "not_found",
            QueueError::InvalidStateTransition { .. } => "invalid_state_transition",
            QueueError::Persistence(_) | QueueError::PersistenceLocked(_) => "persistence_error",
        };
        Self {
            code: code.to_string(),
            message: err.to_string(),
        }
    }
}

/// Queue-facing API over a shared [`QueueManager`].
pub struct QueueApi<S> {
    queue: Arc<QueueManager<S>>,
}

impl<S> Clone for QueueApi<S> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
        }
    }
}

impl<S: QueueStore> QueueApi<S> {
    /// API over `queue`.
    pub const fn new(queue: Arc<QueueManager<S>>) -> Self {
        Self { queue }
    }

    /// Submit an experiment.
    pub fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueResponse, ApiError> {
        let enqueued = self.queue.enqueue(request.owner_id, request.payload)?;
        Ok(EnqueueResponse {
            experiment_id: enqueued.id,
            queue_position: enqueued.position,
        })
    }

    /// Status of one experiment.
    pub fn status(&self, id: &ExperimentId) -> Result<ExperimentStatus, ApiError> {
        Ok(self.queue.status(id)?)
    }

    /// Active experiments in dispatch order.
    pub fn list_queue(&self) -> Vec<QueueEntry> {
        self.queue.list_queue()
    }

    /// One owner's experiments, newest first.
    pub fn list_for_owner(&self, owner: &str) -> Vec<ExperimentStatus> {
        self.queue.list_for_owner(owner)
    }

    /// Counts and estimated wait.
    pub fn summary(&self) -> QueueSummary {
        self.queue.summary()
    }

    /// Apply a control command.
    pub fn control(&self, command: ControlCommand) -> Result<ControlResponse, ApiError> {
        let (experiment_id, cancel) = match command {
            ControlCommand::Cancel { experiment_id } => {
                let outcome = self.queue.cancel(&experiment_id)?;
                (experiment_id, Some(outcome))
            }
            ControlCommand::Pause { experiment_id } => {
                self.queue.pause(&experiment_id)?;
                (experiment_id, None)
            }
            ControlCommand::Resume { experiment_id } => {
                self.queue.resume(&experiment_id)?;
                (experiment_id, None)
            }
            ControlCommand::Reorder {
                experiment_id,
                new_position,
            } => {
                self.queue.reorder(&experiment_id, new_position)?;
                (experiment_id, None)
            }
            ControlCommand::RunNow { experiment_id } => {
                self.queue.run_now(&experiment_id)?;
                (experiment_id, None)
            }
        };
        let queue_position = self.queue.status(&experiment_id)?.queue_position;
        Ok(ControlResponse {
            experiment_id,
            cancel,
            queue_position,
        })
    }

    /// Liveness plus persistence state.
    pub fn health(&self) -> Health {
        let persistence_locked = self.queue.is_persistence_locked();
        Health {
            ok: !persistence_locked,
            persistence_locked,
            running: self.queue.running().map(|e| e.id),
        }
    }
}
