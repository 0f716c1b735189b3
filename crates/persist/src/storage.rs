//! Durable key-value byte stores.
//!
//! The persistence layer treats storage as an opaque collaborator: it only
//! needs what was written under a key to be readable again. `MemoryStorage`
//! backs tests; `FileStorage` keeps one file per key under a directory:
//! ```text
//! <root>/
//!   persist%3Acounter.persist   - envelope bytes for key "persist:counter"
//! ```

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Errors from storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid storage key {0:?}")]
    InvalidKey(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Abstract durable key-value byte store.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read the bytes stored under `key`, or `None` if nothing is stored.
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store `bytes` under `key`, replacing any previous value.
    async fn write(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError>;

    /// Remove the value under `key`. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<(), StorageError>;
}

#[async_trait]
impl<S: StorageBackend + ?Sized> StorageBackend for Arc<S> {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        (**self).read(key).await
    }

    async fn write(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        (**self).write(key, bytes).await
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        (**self).remove(key).await
    }
}

/// In-memory storage. Contents are lost when the value is dropped.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently stored under `key`.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().get(key).cloned()
    }

    /// Store bytes directly, bypassing the async interface.
    pub fn insert(&self, key: impl Into<String>, bytes: Vec<u8>) {
        self.lock().insert(key.into(), bytes);
    }

    /// All stored keys in sorted order.
    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.get(key))
    }

    async fn write(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        self.insert(key, bytes);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.lock().remove(key);
        Ok(())
    }
}

const FILE_EXTENSION: &str = "persist";

/// Directory-backed storage: one file per key.
///
/// Writes go to a temporary file that is renamed over the target, so a
/// crash mid-write leaves the previous value readable.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Open storage rooted at `path`, creating the directory if needed.
    ///
    /// This blocks on the directory creation. Call it while assembling the
    /// store, before events flow.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Get the path to the storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Keys that currently have a stored value, in sorted order.
    pub async fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(FILE_EXTENSION) {
                continue;
            }
            if let Some(key) = path.file_stem().and_then(|s| s.to_str()).and_then(unescape_key) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey(key.to_owned()));
        }
        Ok(self
            .root
            .join(format!("{}.{FILE_EXTENSION}", escape_key(key))))
    }
}

#[async_trait]
impl StorageBackend for FileStorage {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        let tmp = path.with_extension(format!("{FILE_EXTENSION}.tmp"));
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Escape a key into a portable file stem: `[A-Za-z0-9_-]` pass through,
/// every other byte becomes `%XX`.
fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn unescape_key(stem: &str) -> Option<String> {
    let bytes = stem.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = stem.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_escaping_roundtrips() {
        for key in ["persist:counter", "a/b c", "plain_key-1", "ünïcode"] {
            let escaped = escape_key(key);
            assert!(!escaped.contains(['/', ':', ' ', '.']));
            assert_eq!(unescape_key(&escaped).as_deref(), Some(key));
        }
    }

    #[tokio::test]
    async fn memory_storage_read_write_remove() {
        let storage = MemoryStorage::new();
        assert!(storage.read("k").await.unwrap().is_none());

        storage.write("k", b"v1".to_vec()).await.unwrap();
        assert_eq!(storage.read("k").await.unwrap(), Some(b"v1".to_vec()));

        storage.remove("k").await.unwrap();
        storage.remove("k").await.unwrap();
        assert!(storage.keys().is_empty());
    }

    #[tokio::test]
    async fn file_storage_persists_across_instances() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("state");
        {
            let storage = FileStorage::open(&dir).unwrap();
            storage
                .write("persist:counter", b"{\"count\":3}".to_vec())
                .await
                .unwrap();
        }

        let storage = FileStorage::open(&dir).unwrap();
        assert_eq!(
            storage.read("persist:counter").await.unwrap(),
            Some(b"{\"count\":3}".to_vec())
        );
        assert_eq!(storage.keys().await.unwrap(), vec!["persist:counter".to_string()]);
    }

    #[tokio::test]
    async fn file_storage_missing_key_is_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(tmp.path()).unwrap();
        assert!(storage.read("nothing").await.unwrap().is_none());
        storage.remove("nothing").await.unwrap();
    }

    #[tokio::test]
    async fn file_storage_rejects_empty_key() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(tmp.path()).unwrap();
        assert!(matches!(
            storage.write("", Vec::new()).await,
            Err(StorageError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn file_storage_overwrite_replaces_value() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(tmp.path()).unwrap();
        storage.write("k", b"first".to_vec()).await.unwrap();
        storage.write("k", b"second".to_vec()).await.unwrap();
        assert_eq!(storage.read("k").await.unwrap(), Some(b"second".to_vec()));
        assert_eq!(storage.keys().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn file_storage_keys_skip_foreign_files() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(tmp.path()).unwrap();
        storage.write("persist:b", b"2".to_vec()).await.unwrap();
        storage.write("persist:a", b"1".to_vec()).await.unwrap();
        tokio::fs::write(tmp.path().join("notes.txt"), b"x").await.unwrap();

        assert_eq!(
            storage.keys().await.unwrap(),
            vec!["persist:a".to_string(), "persist:b".to_string()]
        );
    }
}
