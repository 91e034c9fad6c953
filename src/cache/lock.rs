//! Per-key miss locks.
//!
//! Concurrent misses for one key would otherwise all regenerate the page
//! and race to store it. [`KeyLocks`] hands out one async mutex per key so
//! only the first miss runs the inner handler; the rest wait, then find the
//! stored entry. Keys never contend with each other, and an entry disappears
//! once nobody holds or waits on its lock.
//!
//! A holder whose response turned out not to be storable marks its guard
//! rejected. Waiters queued behind it see the mark and stop serializing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Map of key → async mutex, holding only weak references.
///
/// The mutex value records whether the last holder's response was rejected.
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: Mutex<HashMap<String, Weak<AsyncMutex<bool>>>>,
}

/// Held while regenerating one key. Dropping it releases the key.
#[derive(Debug)]
pub struct KeyGuard {
    inner: OwnedMutexGuard<bool>,
}

impl KeyGuard {
    /// `true` when the previous holder's response was not storable.
    pub fn previous_rejected(&self) -> bool {
        *self.inner
    }

    pub fn set_rejected(&mut self, rejected: bool) {
        *self.inner = rejected;
    }
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until no other task holds the lock for `key`, then takes it.
    pub async fn acquire(&self, key: &str) -> KeyGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            match locks.get(key).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    locks.retain(|_, weak| weak.strong_count() > 0);
                    let lock = Arc::new(AsyncMutex::new(false));
                    locks.insert(key.to_owned(), Arc::downgrade(&lock));
                    lock
                }
            }
        };
        KeyGuard {
            inner: lock.lock_owned().await,
        }
    }

    /// Number of keys with a live lock.
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
