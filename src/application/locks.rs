use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Per-order exclusive locks.
///
/// Each order code maps to its own async mutex, so deliveries for one order
/// queue behind each other while different orders never contend. Entries are
/// held weakly and disappear once no task holds or awaits the lock.
#[derive(Default)]
pub struct OrderLocks {
    slots: Mutex<HashMap<String, Weak<AsyncMutex<()>>>>,
}

pub type OrderGuard = OwnedMutexGuard<()>;

impl OrderLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `code`. Released when the guard drops.
    pub async fn lock(&self, code: &str) -> OrderGuard {
        self.slot(code).lock_owned().await
    }

    fn slot(&self, code: &str) -> Arc<AsyncMutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = slots.get(code).and_then(Weak::upgrade) {
            return slot;
        }
        slots.retain(|_, weak| weak.strong_count() > 0);
        let slot = Arc::new(AsyncMutex::new(()));
        slots.insert(code.to_string(), Arc::downgrade(&slot));
        slot
    }

    /// Number of orders currently locked or awaited.
    pub fn active(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.values().filter(|weak| weak.strong_count() > 0).count()
    }
}
