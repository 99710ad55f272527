use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Lazily created locks, one per sandbox id.
///
/// The outer mutex is only held while looking up or inserting an entry, never while waiting on a
/// sandbox lock, so operations on different sandboxes never contend.
#[derive(Debug, Default)]
pub struct SandboxLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SandboxLocks {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to a sandbox.
    pub async fn lock(&self, sandbox_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(sandbox_id.to_string()).or_default().clone()
        };

        lock.lock_owned().await
    }

    /// Drops the lock entry of a destroyed sandbox once nobody holds or waits on it.
    ///
    /// Call after releasing the guard. While a holder or waiter still references the lock, the
    /// entry stays so that later callers queue behind them instead of getting a fresh lock.
    /// Returns whether the entry was removed.
    pub fn remove(&self, sandbox_id: &str) -> bool {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let idle = locks
            .get(sandbox_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1);
        if idle {
            locks.remove(sandbox_id);
        }

        idle
    }

    /// Number of sandboxes with a lock entry.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no sandbox has a lock entry.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
