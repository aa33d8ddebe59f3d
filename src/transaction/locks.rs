// ============================================================================
// Work Locks
// ============================================================================
//
// Per-key exclusive ownership table. Keys are work ids such as
// "<message id>@<time to send>" for dispatch claims, "invoke:<sequence id>"
// for in-order invocation and "seq:<owner id>" around one sequence's
// transactions. Claims and invoke locks are taken before sequence locks.
// Entries exist only while someone holds or waits for the key.
//
// ============================================================================

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Slot = Arc<AsyncMutex<()>>;

#[derive(Default)]
pub struct WorkLocks {
    slots: Mutex<HashMap<String, Slot>>,
}

/// Exclusive claim on one work id; released on drop.
pub struct WorkGuard {
    locks: Arc<WorkLocks>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl WorkGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.guard.take();
        self.locks.release_slot(&self.key);
    }
}

impl WorkLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn slot_for(&self, key: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(|poison| poison.into_inner());
        slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn release_slot(&self, key: &str) {
        let mut slots = self.slots.lock().unwrap_or_else(|poison| poison.into_inner());
        let unused = slots
            .get(key)
            .map(|slot| Arc::strong_count(slot) == 1)
            .unwrap_or(false);
        if unused {
            slots.remove(key);
        }
    }

    /// Waits until the key is free and claims it.
    pub async fn acquire(self: &Arc<Self>, key: impl Into<String>) -> WorkGuard {
        let key = key.into();
        let slot = self.slot_for(&key);
        let guard = slot.lock_owned().await;
        WorkGuard {
            locks: Arc::clone(self),
            key,
            guard: Some(guard),
        }
    }

    /// Claims the key only if nobody holds it.
    pub fn try_claim(self: &Arc<Self>, key: impl Into<String>) -> Option<WorkGuard> {
        let key = key.into();
        let slot = self.slot_for(&key);
        match slot.try_lock_owned() {
            Ok(guard) => Some(WorkGuard {
                locks: Arc::clone(self),
                key,
                guard: Some(guard),
            }),
            Err(_) => {
                self.release_slot(&key);
                None
            }
        }
    }

    pub fn is_held(&self, key: &str) -> bool {
        let slots = self.slots.lock().unwrap_or_else(|poison| poison.into_inner());
        slots
            .get(key)
            .map(|slot| slot.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Number of keys currently held or awaited.
    pub fn active_keys(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .len()
    }
}
