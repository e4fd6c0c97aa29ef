//! In-memory storage backend for testing.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::provider::{validate_key, StorageBackend};
use offsync_common::{Error, Result};

/// In-memory storage backend.
///
/// Useful for testing and for ephemeral sessions. All data is stored in memory
/// and lost on drop. Clones share the same storage, which lets tests simulate
/// a process restart by reopening a queue on a clone.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    storage: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    read_only: Arc<AtomicBool>,
}

impl MemoryBackend {
    /// Create a new empty memory backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject writes and removals with `Error::Storage`, as a full or
    /// read-only disk would. Shared by clones.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(Error::Storage("Memory backend is read-only".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        let storage = self.storage.read().unwrap_or_else(|e| e.into_inner());
        Ok(storage.get(key).cloned())
    }

    async fn store(&self, key: &str, data: Vec<u8>) -> Result<()> {
        validate_key(key)?;
        self.check_writable()?;
        self.storage
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), data);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.check_writable()?;
        self.storage
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let storage = self.storage.read().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<String> = storage.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_and_load() {
        let backend = MemoryBackend::new();
        backend.store("queue", b"[]".to_vec()).await.unwrap();
        assert_eq!(backend.load("queue").await.unwrap(), Some(b"[]".to_vec()));
        assert_eq!(backend.keys().await.unwrap(), vec!["queue".to_string()]);
    }

    #[tokio::test]
    async fn test_remove_missing_is_ok() {
        let backend = MemoryBackend::new();
        backend.remove("nothing").await.unwrap();
        assert!(backend.load("nothing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clones_share_storage() {
        let backend = MemoryBackend::new();
        let clone = backend.clone();
        backend.store("k", vec![1, 2, 3]).await.unwrap();
        assert_eq!(clone.load("k").await.unwrap(), Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_read_only_rejects_writes() {
        let backend = MemoryBackend::new();
        backend.store("k", vec![1]).await.unwrap();

        let clone = backend.clone();
        clone.set_read_only(true);
        assert!(matches!(backend.store("k", vec![2]).await, Err(Error::Storage(_))));
        assert!(backend.remove("k").await.is_err());
        assert_eq!(backend.load("k").await.unwrap(), Some(vec![1]));

        clone.set_read_only(false);
        backend.store("k", vec![2]).await.unwrap();
        assert_eq!(backend.load("k").await.unwrap(), Some(vec![2]));
    }
}
