//! Key/value storage backends for session state
//!
//! Defines the `Storage` trait that decouples the credential store from where
//! bytes actually live. `FileStorage` is the persistent backend (survives
//! restarts, atomic writes); `MemoryStorage` is the ephemeral backend used for
//! short-lived values such as the pending OAuth state, and doubles as a test
//! backend that can simulate quota exhaustion or disabled storage.

pub mod file;
pub mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

use std::future::Future;
use std::pin::Pin;

/// Errors from storage backends.
///
/// Callers in this workspace treat every variant as "storage unusable right
/// now" and degrade to an empty read or a failed write.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("storage quota exceeded: {used} of {quota} bytes")]
    QuotaExceeded { used: usize, quota: usize },

    #[error("storage I/O error: {0}")]
    Io(String),

    #[error("storage contents corrupt: {0}")]
    Corrupt(String),
}

/// Result alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Boxed future returned by `Storage` methods.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// String key/value store with browser-storage semantics.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn Storage>`).
pub trait Storage: Send + Sync {
    /// Identifier for logging (e.g. "file", "memory")
    fn id(&self) -> &str;

    /// Read the value under `key`, `None` if absent.
    fn get<'a>(&'a self, key: &'a str) -> StorageFuture<'a, Option<String>>;

    /// Insert or replace the value under `key`.
    fn set<'a>(&'a self, key: &'a str, value: String) -> StorageFuture<'a, ()>;

    /// Delete `key`. Removing an absent key is not an error.
    fn remove<'a>(&'a self, key: &'a str) -> StorageFuture<'a, ()>;
}
