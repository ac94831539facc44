use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A map of independently locked values, one per key (e.g. upload identifier).
/// Holding the guard for one key never blocks another key; the map itself is
/// only touched briefly to look up or insert the slot.
#[derive(Debug)]
pub struct KeyedMutex<V> {
    slots: Arc<DashMap<String, Arc<Mutex<V>>>>,
}

impl<V> Clone for KeyedMutex<V> {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
        }
    }
}

impl<V: Send + 'static> KeyedMutex<V> {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
        }
    }

    /// Locks the slot for `key`, creating it with `init` when absent.
    /// The lock is released when the returned guard is dropped.
    pub async fn lock_or_insert_with(
        &self,
        key: &str,
        init: impl FnOnce() -> V,
    ) -> OwnedMutexGuard<V> {
        let slot = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(init())))
            .value()
            .clone();

        // The DashMap shard guard is gone before we await the slot.
        slot.lock_owned().await
    }

    /// Locks the slot for `key` if one exists.
    pub async fn lock(&self, key: &str) -> Option<OwnedMutexGuard<V>> {
        let slot = self.slots.get(key).map(|s| s.value().clone())?;
        Some(slot.lock_owned().await)
    }

    /// Drops the slot for `key`. Tasks already holding or waiting on it keep
    /// their `Arc` and observe whatever state was left in it.
    pub fn remove(&self, key: &str) {
        self.slots.remove(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.slots.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.slots.iter().map(|e| e.key().clone()).collect()
    }
}

impl<V: Send + 'static> Default for KeyedMutex<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let locks: KeyedMutex<u32> = KeyedMutex::new();
        let mut guard = locks.lock_or_insert_with("a", || 0).await;
        *guard += 1;

        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let guard = other.lock_or_insert_with("a", || 100).await;
            *guard
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);

        assert_eq!(waiter.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_contend() {
        let locks: KeyedMutex<()> = KeyedMutex::new();
        let _a = locks.lock_or_insert_with("a", || ()).await;
        let b = tokio::time::timeout(
            Duration::from_millis(100),
            locks.lock_or_insert_with("b", || ()),
        )
        .await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn test_remove_and_lock_missing() {
        let locks: KeyedMutex<u32> = KeyedMutex::new();
        drop(locks.lock_or_insert_with("a", || 7).await);
        assert_eq!(*locks.lock("a").await.unwrap(), 7);

        locks.remove("a");
        assert!(locks.lock("a").await.is_none());
        assert!(locks.is_empty());
    }
}
