//! Storage backend trait definition.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use offsync_common::{Error, Result};

/// Key-value persistence backend for the sync core.
///
/// The core keeps a small number of named blobs (the action queue and the
/// cache) and rewrites each blob as a whole. Backends only need to store
/// opaque bytes under a flat key.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Get the backend name (e.g., "memory", "local").
    fn name(&self) -> &str;

    /// Read the blob stored under `key`.
    ///
    /// # Returns
    /// `None` if nothing has been stored under the key.
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Replace the blob stored under `key`.
    ///
    /// # Postconditions
    /// - A subsequent `load(key)` returns `data`, also after a process restart
    ///   for durable backends
    /// - A failed write leaves the previous blob intact
    async fn store(&self, key: &str, data: Vec<u8>) -> Result<()>;

    /// Delete the blob stored under `key`. Deleting a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;

    /// List stored keys.
    async fn keys(&self) -> Result<Vec<String>>;
}

/// Validate a blob key.
///
/// Keys are flat names; they must be non-empty and contain no path separators.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidInput("Storage key cannot be empty".to_string()));
    }
    if key.contains('/') || key.contains('\\') || key == "." || key == ".." {
        return Err(Error::InvalidInput(format!(
            "Storage key cannot contain separators: {}",
            key
        )));
    }
    Ok(())
}

/// Load and deserialize a JSON blob.
pub async fn load_json<T: DeserializeOwned>(
    backend: &dyn StorageBackend,
    key: &str,
) -> Result<Option<T>> {
    match backend.load(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Serialize a value as JSON and store it.
pub async fn store_json<T: Serialize + ?Sized>(
    backend: &dyn StorageBackend,
    key: &str,
    value: &T,
) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    backend.store(key, bytes).await
}
