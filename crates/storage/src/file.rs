//! File-backed persistent storage
//!
//! Keeps a flat JSON object (`{"key": "value", ...}`) on disk. All writes use
//! atomic temp-file + rename so a crash mid-write never leaves a torn file, and
//! a tokio Mutex serializes concurrent writers. The in-memory map is the read
//! path; disk is only touched on writes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{Result, Storage, StorageError, StorageFuture};

/// Persistent key/value file.
pub struct FileStorage {
    path: PathBuf,
    state: Mutex<HashMap<String, String>>,
}

impl FileStorage {
    /// Load the storage file at `path`.
    ///
    /// If the file doesn't exist, creates it as `{}`. An unparseable file is
    /// reported as `StorageError::Corrupt`; use `load_or_reset` to recover.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| StorageError::Io(format!("reading storage file: {e}")))?;
            let entries: HashMap<String, String> = serde_json::from_str(&contents)
                .map_err(|e| StorageError::Corrupt(format!("parsing storage file: {e}")))?;
            info!(path = %path.display(), keys = entries.len(), "loaded storage file");
            entries
        } else {
            info!(path = %path.display(), "storage file not found, starting empty");
            let entries = HashMap::new();
            write_atomic(&path, &entries).await?;
            entries
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Load the storage file, replacing it with an empty one if it is corrupt.
    pub async fn load_or_reset(path: PathBuf) -> Result<Self> {
        match Self::load(path.clone()).await {
            Err(StorageError::Corrupt(reason)) => {
                warn!(path = %path.display(), %reason, "storage file corrupt, resetting");
                let entries = HashMap::new();
                write_atomic(&path, &entries).await?;
                Ok(Self {
                    path,
                    state: Mutex::new(entries),
                })
            }
            other => other,
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Storage for FileStorage {
    fn id(&self) -> &str {
        "file"
    }

    fn get<'a>(&'a self, key: &'a str) -> StorageFuture<'a, Option<String>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.get(key).cloned())
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: String) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let previous = state.insert(key.to_string(), value);
            if let Err(e) = write_atomic(&self.path, &state).await {
                // Keep memory in step with what's on disk
                match previous {
                    Some(old) => state.insert(key.to_string(), old),
                    None => state.remove(key),
                };
                return Err(e);
            }
            debug!(key, "stored value");
            Ok(())
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let Some(previous) = state.remove(key) else {
                return Ok(());
            };
            if let Err(e) = write_atomic(&self.path, &state).await {
                state.insert(key.to_string(), previous);
                return Err(e);
            }
            debug!(key, "removed value");
            Ok(())
        })
    }
}

/// Write entries to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Sets permissions to 0600 (owner read/write only) since the
/// file holds bearer credentials.
async fn write_atomic(path: &Path, data: &HashMap<String, String>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| StorageError::Io(format!("serializing storage: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| StorageError::Io("storage path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".storage.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| StorageError::Io(format!("writing temp storage file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| StorageError::Io(format!("setting storage file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| StorageError::Io(format!("renaming temp storage file: {e}")))?;

    debug!(path = %path.display(), "persisted storage");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn values_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let storage = FileStorage::load(path.clone()).await.unwrap();
        storage.set("auth_token", "tok".into()).await.unwrap();
        storage.set("auth_user", r#"{"id":"u1"}"#.into()).await.unwrap();

        let reloaded = FileStorage::load(path).await.unwrap();
        assert_eq!(
            reloaded.get("auth_token").await.unwrap().as_deref(),
            Some("tok")
        );
        assert_eq!(
            reloaded.get("auth_user").await.unwrap().as_deref(),
            Some(r#"{"id":"u1"}"#)
        );
    }

    #[tokio::test]
    async fn cold_start_creates_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        assert!(!path.exists());
        let storage = FileStorage::load(path.clone()).await.unwrap();
        assert!(storage.get("auth_token").await.unwrap().is_none());

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: HashMap<String, String> = serde_json::from_str(&contents).unwrap();
        assert!(parsed.is_empty());
    }

    #[tokio::test]
    async fn remove_deletes_key_and_tolerates_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let storage = FileStorage::load(path.clone()).await.unwrap();
        storage.set("k", "v".into()).await.unwrap();
        storage.remove("k").await.unwrap();
        storage.remove("k").await.unwrap();

        let reloaded = FileStorage::load(path).await.unwrap();
        assert!(reloaded.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_file_is_reported_then_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();

        let result = FileStorage::load(path.clone()).await;
        assert!(matches!(result, Err(StorageError::Corrupt(_))));

        let storage = FileStorage::load_or_reset(path.clone()).await.unwrap();
        assert!(storage.get("anything").await.unwrap().is_none());
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents.trim(), "{}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let storage = FileStorage::load(path.clone()).await.unwrap();
        storage.set("auth_token", "tok".into()).await.unwrap();

        let metadata = tokio::fs::metadata(&path).await.unwrap();
        let mode = metadata.permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "storage file must be 0600, got {mode:o}");
    }

    #[tokio::test]
    async fn concurrent_writes_dont_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let storage = std::sync::Arc::new(FileStorage::load(path.clone()).await.unwrap());

        let mut handles = vec![];
        for i in 0..10 {
            let storage = storage.clone();
            handles.push(tokio::spawn(async move {
                storage.set(&format!("key-{i}"), i.to_string()).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: HashMap<String, String> = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed.len(), 10);
    }
}
