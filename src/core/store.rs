//! Durable queue state and the storage abstraction behind it.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::experiment::{Experiment, ExperimentState};
use crate::util::ExperimentId;

/// Current on-disk format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Everything needed to rebuild the queue after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Format version.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Every known experiment keyed by id.
    #[serde(default)]
    pub experiments: BTreeMap<ExperimentId, Experiment>,
    /// Dispatch order of QUEUED experiments; index is the dense position.
    #[serde(default)]
    pub queue_order: Vec<ExperimentId>,
}

const fn default_version() -> u32 {
    SNAPSHOT_VERSION
}

impl Default for QueueSnapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            experiments: BTreeMap::new(),
            queue_order: Vec::new(),
        }
    }
}

impl QueueSnapshot {
    /// Repair `queue_order` so it lists each QUEUED experiment exactly once.
    ///
    /// Unknown, duplicate and non-QUEUED ids are dropped; QUEUED experiments
    /// missing from the order are appended by creation time. Returns `true`
    /// when anything changed.
    pub fn normalize(&mut self) -> bool {
        let before = self.queue_order.clone();
        let mut seen = HashSet::new();
        let experiments = &self.experiments;
        self.queue_order.retain(|id| {
            experiments
                .get(id)
                .is_some_and(|e| e.state == ExperimentState::Queued)
                && seen.insert(id.clone())
        });
        let mut missing: Vec<&Experiment> = self
            .experiments
            .values()
            .filter(|e| e.state == ExperimentState::Queued && !seen.contains(&e.id))
            .collect();
        missing.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        self.queue_order.extend(missing.into_iter().map(|e| e.id.clone()));
        self.queue_order != before
    }

    /// Dense position of a QUEUED experiment.
    #[must_use]
    pub fn position_of(&self, id: &ExperimentId) -> Option<usize> {
        self.queue_order.iter().position(|q| q == id)
    }
}

/// Storage failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure at a given path.
    #[error("io error at {path}: {source}")]
    Io {
        /// Path being read or written.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Snapshot could not be encoded.
    #[error("serialize error: {0}")]
    Serialize(String),
    /// Stored bytes are not a valid snapshot.
    #[error("corrupt queue state: {0}")]
    Corrupt(String),
    /// Backend refused the write (used by test doubles and remote stores).
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Durable record of the queue. Only `QueueManager` calls into it.
pub trait QueueStore: Send {
    /// Load the last saved snapshot, `None` when nothing was saved yet.
    fn load(&mut self) -> Result<Option<QueueSnapshot>, StoreError>;

    /// Durably replace the stored snapshot. Must not return before the data is safe.
    fn save(&mut self, snapshot: &QueueSnapshot) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::experiment::ExperimentPayload;
    use chrono::{Duration, Utc};

    fn experiment(state: ExperimentState, offset_secs: i64) -> Experiment {
        let mut e = Experiment::new(
            "owner".into(),
            ExperimentPayload::new("print(1)"),
            Utc::now() + Duration::seconds(offset_secs),
        );
        e.state = state;
        e
    }

    #[test]
    fn normalize_drops_stale_and_appends_missing() {
        let mut snap = QueueSnapshot::default();
        let queued_late = experiment(ExperimentState::Queued, 10);
        let queued_early = experiment(ExperimentState::Queued, 0);
        let done = experiment(ExperimentState::Completed, 0);
        snap.queue_order = vec![
            done.id.clone(),
            ExperimentId::from("ghost"),
            queued_late.id.clone(),
            queued_late.id.clone(),
        ];
        for e in [&queued_late, &queued_early, &done] {
            snap.experiments.insert(e.id.clone(), e.clone());
        }

        assert!(snap.normalize());
        assert_eq!(snap.queue_order, vec![queued_late.id.clone(), queued_early.id]);
        assert!(!snap.normalize());
    }
}
