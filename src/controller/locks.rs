//! Per-key async mutual exclusion
//!
//! Lifecycle mutations on one experiment are serialized through the lock for
//! its id; different keys never contend. Entries are dropped once no caller
//! holds or waits on them.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Map size above which idle entries are swept on acquire
const SWEEP_THRESHOLD: usize = 1024;

pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K> Default for KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for exclusive access to `key`
    ///
    /// The returned guard releases the key on drop, including when the
    /// awaiting future is cancelled.
    pub async fn acquire(&self, key: &K) -> OwnedMutexGuard<()> {
        let lock = {
            // The map mutex is only held for lookup/insert
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            if locks.len() > SWEEP_THRESHOLD {
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Number of tracked keys (idle ones included until swept)
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let locks = Arc::new(KeyedLocks::new());
        let guard = locks.acquire(&"a").await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.acquire(&"a").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished(), "second acquire should wait");

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .expect("contender should acquire after release")
            .expect("task should not panic");
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.acquire(&"a").await;

        let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire(&"b")).await;
        assert!(b.is_ok(), "different key must not block");
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_releases_nothing_held() {
        let locks = KeyedLocks::new();
        let guard = locks.acquire(&1u32).await;

        let waited = tokio::time::timeout(Duration::from_millis(10), locks.acquire(&1u32)).await;
        assert!(waited.is_err());

        drop(guard);
        let again = tokio::time::timeout(Duration::from_millis(100), locks.acquire(&1u32)).await;
        assert!(again.is_ok());
    }
}
