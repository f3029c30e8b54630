//! An in-memory storage layer

use super::{KeyValueStorage, StorageError};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

/// An in-memory key/value store
///
/// Clones share the same underlying map, the way tabs of one origin share
/// their local storage.
#[derive(Clone, Debug, Default)]
pub struct MemoryStorage {
    entries: Arc<Mutex<HashMap<String, String>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryStorage {
    /// Constructs a new, empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent operation fail with [`StorageError::Unavailable`]
    ///
    /// Simulates storage being blocked, such as in a private browsing mode.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    /// Whether any value is stored under `key`, ignoring availability
    pub fn contains_key(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    /// The keys currently stored, ignoring availability
    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::Acquire) {
            Err(StorageError::Unavailable)
        } else {
            Ok(())
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        // A poisoned map still holds consistent string entries
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl KeyValueStorage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.check()?;
        Ok(self.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.check()?;
        self.lock().insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.check()?;
        self.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clones_share_entries() {
        let tab_a = MemoryStorage::new();
        let tab_b = tab_a.clone();

        tab_a.set("key", "value").await.unwrap();

        assert_eq!(tab_b.get("key").await.unwrap().as_deref(), Some("value"));
    }

    #[tokio::test]
    async fn unavailable_storage_rejects_every_operation() {
        let storage = MemoryStorage::new();
        storage.set_unavailable(true);

        assert!(matches!(
            storage.get("key").await,
            Err(StorageError::Unavailable)
        ));
        assert!(matches!(
            storage.set("key", "value").await,
            Err(StorageError::Unavailable)
        ));
        assert!(!storage.contains_key("key"));
    }
}
