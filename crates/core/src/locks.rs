//! Per-account advisory locks
//!
//! The grant and credential paths are read-check-write sequences: two
//! concurrent payments for one account could both pass the "no active grant"
//! check and create duplicate grants. Every such sequence takes the account's
//! lock first. Different accounts never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Once the map reaches this many entries, unheld ones are dropped before
/// the next insert. Keeps the map bounded by the number of accounts locked
/// concurrently rather than ever.
const PRUNE_THRESHOLD: usize = 1024;

/// Async mutexes keyed by account id, created lazily on first use.
#[derive(Default)]
pub struct KeyedLocks {
    inner: StdMutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, waiting if another task holds it.
    pub async fn lock(&self, key: i64) -> OwnedMutexGuard<()> {
        let entry = {
            #[allow(clippy::unwrap_used)] // map mutex is never poisoned: no panics while held
            let mut map = self.inner.lock().unwrap();
            if map.len() >= PRUNE_THRESHOLD {
                // A strong count of one means only the map holds the Arc:
                // nobody is holding or waiting on that key's lock.
                map.retain(|_, m| Arc::strong_count(m) > 1);
            }
            Arc::clone(map.entry(key).or_default())
        };
        entry.lock_owned().await
    }

    /// Number of keys currently tracked. Diagnostics only.
    pub fn key_count(&self) -> usize {
        #[allow(clippy::unwrap_used)]
        let map = self.inner.lock().unwrap();
        map.len()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn same_key_serializes() {
        let locks = Arc::new(KeyedLocks::new());
        let in_section = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let locks = Arc::clone(&locks);
            let in_section = Arc::clone(&in_section);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(42).await;
                let n = in_section.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(n, Ordering::SeqCst);
                tokio::task::yield_now().await;
                in_section.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1, "critical section overlapped");
    }

    #[tokio::test]
    async fn different_keys_do_not_contend() {
        let locks = KeyedLocks::new();
        let _a = locks.lock(1).await;
        // Would deadlock if keys shared a mutex.
        let _b = locks.lock(2).await;
        assert_eq!(locks.key_count(), 2);
    }

    #[tokio::test]
    async fn lock_is_reusable_after_release() {
        let locks = KeyedLocks::new();
        drop(locks.lock(9).await);
        let _again = locks.lock(9).await;
        assert_eq!(locks.key_count(), 1);
    }

    #[tokio::test]
    async fn released_keys_are_pruned() {
        let locks = KeyedLocks::new();
        for key in 0..(2 * PRUNE_THRESHOLD as i64) {
            drop(locks.lock(key).await);
        }
        // Every guard was dropped, so the map never outgrows the threshold.
        assert!(locks.key_count() <= PRUNE_THRESHOLD);
    }

    #[tokio::test]
    async fn pruning_never_drops_a_held_lock() {
        let locks = Arc::new(KeyedLocks::new());
        let guard = locks.lock(7).await;

        // Enough traffic on other keys to force pruning passes.
        for key in 1000..(1000 + 2 * PRUNE_THRESHOLD as i64) {
            drop(locks.lock(key).await);
        }

        let contender = Arc::clone(&locks);
        let handle = tokio::spawn(async move {
            let _g = contender.lock(7).await;
        });
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        // Key 7 survived pruning, so the contender is still parked on the
        // same mutex rather than a fresh one.
        assert!(!handle.is_finished());

        drop(guard);
        handle.await.unwrap();
    }
}
