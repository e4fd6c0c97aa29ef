//! Local filesystem storage backend.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::provider::{validate_key, StorageBackend};
use offsync_common::{Error, Result};

const BLOB_EXTENSION: &str = "json";

/// Local filesystem storage backend.
///
/// Each key is stored as `<root>/<key>.json`. Writes go to a temporary file
/// first and are renamed into place, so a crash mid-write never leaves a
/// truncated blob behind.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Create a new local backend with the given root directory.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        // Create root if it doesn't exist (sync for constructor)
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        Ok(Self { root })
    }

    /// Root directory of this backend.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.{}", key, BLOB_EXTENSION))
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        match fs::read(self.blob_path(key)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn store(&self, key: &str, data: Vec<u8>) -> Result<()> {
        validate_key(key)?;
        let target = self.blob_path(key);
        let tmp = self.root.join(format!(".{}.{}.tmp", key, BLOB_EXTENSION));

        fs::write(&tmp, &data).await?;
        fs::rename(&tmp, &target).await?;

        debug!("Stored {} bytes under {}", data.len(), key);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        match fs::remove_file(self.blob_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some(BLOB_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if !stem.starts_with('.') {
                    keys.push(stem.to_string());
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}
