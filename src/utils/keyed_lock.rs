use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

/// Async mutexes keyed by record ID.
///
/// Holding the guard for a record serializes "change the record, then publish the change"
/// so events for one record leave in commit order. Entries are dropped once nobody holds
/// or waits on them.
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

pub struct KeyedGuard<'a> {
    owner: &'a KeyedLocks,
    key: Uuid,
    _guard: OwnedMutexGuard<()>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: Uuid) -> KeyedGuard<'_> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(key).or_default().clone()
        };

        KeyedGuard {
            owner: self,
            key,
            _guard: mutex.lock_owned().await,
        }
    }

    /// Number of records currently locked or awaited
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.owner.locks.lock().unwrap_or_else(|e| e.into_inner());
        // The map and this guard hold one reference each; anything more is a waiter
        if let Some(mutex) = locks.get(&self.key) {
            if Arc::strong_count(mutex) <= 2 {
                locks.remove(&self.key);
            }
        }
    }
}
