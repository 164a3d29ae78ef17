//! In-memory queue store for tests and ephemeral deployments.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::{QueueSnapshot, QueueStore, StoreError};

/// Keeps the last saved snapshot in memory.
///
/// Clones share state, so a test can keep a handle, inspect what was saved,
/// and flip [`InMemoryStore::set_fail_writes`] to simulate a broken disk.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    saved: Arc<Mutex<Option<QueueSnapshot>>>,
    fail_writes: Arc<AtomicBool>,
    saves: Arc<AtomicUsize>,
}

impl InMemoryStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with a snapshot, as if written by an earlier process.
    #[must_use]
    pub fn with_snapshot(snapshot: QueueSnapshot) -> Self {
        let store = Self::default();
        *store.saved.lock() = Some(snapshot);
        store
    }

    /// Make subsequent saves fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Last successfully saved snapshot.
    #[must_use]
    pub fn saved(&self) -> Option<QueueSnapshot> {
        self.saved.lock().clone()
    }

    /// Number of successful saves.
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl QueueStore for InMemoryStore {
    fn load(&mut self) -> Result<Option<QueueSnapshot>, StoreError> {
        Ok(self.saved.lock().clone())
    }

    fn save(&mut self, snapshot: &QueueSnapshot) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".into()));
        }
        *self.saved.lock() = Some(snapshot.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
