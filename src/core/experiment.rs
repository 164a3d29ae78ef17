//! Experiment records and their lifecycle states.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::error::QueueError;
use crate::util::{ExperimentId, OwnerId};

/// Largest accepted script body.
pub const MAX_SCRIPT_BYTES: usize = 1024 * 1024;

/// Entry file name used when the payload does not declare one.
pub const DEFAULT_ENTRY_POINT: &str = "user_script.py";

/// Lifecycle state of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentState {
    /// Waiting in the dense ordering.
    Queued,
    /// Dispatched to the execution host.
    Running,
    /// Finished with exit code 0.
    Completed,
    /// Crashed, timed out, or could not be dispatched.
    Failed,
    /// Cancelled by its owner or an operator.
    Cancelled,
    /// Held out of the ordering until resumed.
    Paused,
}

impl ExperimentState {
    /// Terminal states never transition again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// States that count against the owner quota.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Running | Self::Paused)
    }

    /// Lowercase name, as serialized.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Paused => "paused",
        }
    }
}

impl fmt::Display for ExperimentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job script plus declared metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentPayload {
    /// Script text executed inside the sandbox.
    pub script: String,
    /// File name the script is written to; defaults to [`DEFAULT_ENTRY_POINT`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
    /// Free-form metadata declared by the submitter.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ExperimentPayload {
    /// Payload with no metadata and the default entry point.
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            entry_point: None,
            metadata: Map::new(),
        }
    }

    /// Override the entry file name.
    #[must_use]
    pub fn with_entry_point(mut self, entry: impl Into<String>) -> Self {
        self.entry_point = Some(entry.into());
        self
    }

    /// Attach one metadata key.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// File name the script is materialized as.
    #[must_use]
    pub fn entry_file_name(&self) -> &str {
        self.entry_point.as_deref().unwrap_or(DEFAULT_ENTRY_POINT)
    }

    /// Reject malformed payloads before anything is created.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.script.trim().is_empty() {
            return Err(QueueError::Validation("script must not be empty".into()));
        }
        if self.script.len() > MAX_SCRIPT_BYTES {
            return Err(QueueError::Validation(format!(
                "script is {} bytes, limit is {MAX_SCRIPT_BYTES}",
                self.script.len()
            )));
        }
        if self.script.contains('\0') {
            return Err(QueueError::Validation("script contains a NUL byte".into()));
        }
        if let Some(entry) = &self.entry_point {
            let valid = !entry.is_empty()
                && entry != "."
                && entry != ".."
                && !entry.contains(['/', '\\', '\0']);
            if !valid {
                return Err(QueueError::Validation(format!(
                    "entry point `{entry}` must be a plain file name"
                )));
            }
        }
        Ok(())
    }
}

/// One tracked unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    /// Identity.
    pub id: ExperimentId,
    /// Submitting owner.
    pub owner: OwnerId,
    /// Script and metadata.
    pub payload: ExperimentPayload,
    /// Current lifecycle state.
    pub state: ExperimentState,
    /// Enqueue time.
    pub created_at: DateTime<Utc>,
    /// Set on dispatch.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// Set on entering a terminal state.
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Process exit code, when one was observed.
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Failure or cancellation reason.
    #[serde(default)]
    pub error: Option<String>,
    /// A stop was requested while RUNNING; the dispatch loop settles it.
    #[serde(default)]
    pub cancel_requested: bool,
}

impl Experiment {
    pub(crate) fn new(owner: OwnerId, payload: ExperimentPayload, now: DateTime<Utc>) -> Self {
        Self {
            id: ExperimentId::new(),
            owner,
            payload,
            state: ExperimentState::Queued,
            created_at: now,
            started_at: None,
            finished_at: None,
            exit_code: None,
            error: None,
            cancel_requested: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_and_active_partition_states() {
        use ExperimentState::*;
        for state in [Queued, Running, Completed, Failed, Cancelled, Paused] {
            assert_ne!(state.is_terminal(), state.is_active(), "{state}");
        }
    }

    #[test]
    fn blank_script_is_rejected() {
        let err = ExperimentPayload::new("   \n").validate().unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
    }

    #[test]
    fn oversized_script_is_rejected() {
        let payload = ExperimentPayload::new("x".repeat(MAX_SCRIPT_BYTES + 1));
        assert!(payload.validate().is_err());
    }

    #[test]
    fn entry_point_must_be_a_file_name() {
        let payload = ExperimentPayload::new("print(1)").with_entry_point("../escape.py");
        assert!(payload.validate().is_err());
        let payload = ExperimentPayload::new("print(1)").with_entry_point("main.py");
        assert!(payload.validate().is_ok());
        assert_eq!(payload.entry_file_name(), "main.py");
    }

    #[test]
    fn default_entry_point() {
        assert_eq!(
            ExperimentPayload::new("print(1)").entry_file_name(),
            DEFAULT_ENTRY_POINT
        );
    }
}
