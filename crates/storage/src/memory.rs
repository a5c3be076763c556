//! In-memory ephemeral storage
//!
//! Process-scoped: contents vanish when the process exits, which is the
//! lifetime the pending OAuth state needs. A byte quota and an availability
//! switch let tests reproduce the failure modes of real browser storage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;

use crate::{Storage, StorageError, StorageFuture};

/// Ephemeral key/value store.
pub struct MemoryStorage {
    state: Mutex<HashMap<String, String>>,
    quota: Option<usize>,
    available: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            quota: None,
            available: AtomicBool::new(true),
        }
    }

    /// Storage that rejects writes once keys + values exceed `bytes`.
    pub fn with_quota(bytes: usize) -> Self {
        Self {
            quota: Some(bytes),
            ..Self::new()
        }
    }

    /// Storage that fails every operation, like a browser with storage disabled.
    pub fn disabled() -> Self {
        let storage = Self::new();
        storage.set_available(false);
        storage
    }

    /// Toggle availability at runtime.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> crate::Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable("memory storage disabled".into()))
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    fn id(&self) -> &str {
        "memory"
    }

    fn get<'a>(&'a self, key: &'a str) -> StorageFuture<'a, Option<String>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self.state.lock().await.get(key).cloned())
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: String) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            self.check_available()?;
            let mut state = self.state.lock().await;
            if let Some(quota) = self.quota {
                let used: usize = state
                    .iter()
                    .filter(|(k, _)| k.as_str() != key)
                    .map(|(k, v)| k.len() + v.len())
                    .sum();
                let needed = used + key.len() + value.len();
                if needed > quota {
                    return Err(StorageError::QuotaExceeded {
                        used: needed,
                        quota,
                    });
                }
            }
            state.insert(key.to_string(), value);
            Ok(())
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            self.check_available()?;
            self.state.lock().await.remove(key);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_remove() {
        let storage = MemoryStorage::new();
        storage.set("oauth_state", "abc".into()).await.unwrap();
        assert_eq!(
            storage.get("oauth_state").await.unwrap().as_deref(),
            Some("abc")
        );
        storage.remove("oauth_state").await.unwrap();
        assert!(storage.get("oauth_state").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn quota_rejects_oversized_write() {
        let storage = MemoryStorage::with_quota(16);
        storage.set("a", "12345".into()).await.unwrap();

        let err = storage.set("b", "x".repeat(32)).await.unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded { quota: 16, .. }));
        assert!(storage.get("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn quota_counts_replacement_not_sum() {
        let storage = MemoryStorage::with_quota(10);
        storage.set("k", "123456789".into()).await.unwrap();
        // Replacing the same key must not count the old value
        storage.set("k", "987654321".into()).await.unwrap();
    }

    #[tokio::test]
    async fn disabled_storage_fails_every_operation() {
        let storage = MemoryStorage::disabled();
        assert!(matches!(
            storage.get("k").await,
            Err(StorageError::Unavailable(_))
        ));
        assert!(storage.set("k", "v".into()).await.is_err());
        assert!(storage.remove("k").await.is_err());

        storage.set_available(true);
        storage.set("k", "v".into()).await.unwrap();
    }
}
