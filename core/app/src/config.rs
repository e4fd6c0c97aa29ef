//! Core configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use offsync_common::types::duration_ms;
use offsync_common::{Error, Result};
use offsync_storage::{BackendKind, StorageBackend};
use offsync_sync::SyncConfig;

/// Configuration file name inside the data directory.
pub const CONFIG_FILENAME: &str = "offsync.json";

/// Where queued actions and cached responses are persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend name (e.g., "memory", "local").
    pub backend: String,
    /// Directory for the `local` backend.
    pub path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Write cache entries through to the storage backend.
    pub persist: bool,
    /// TTL for `save_cache` calls that do not pass one.
    #[serde(with = "duration_ms", rename = "default_ttl_ms")]
    pub default_ttl: Duration,
    /// TTL of values written by optimistic updates.
    #[serde(with = "duration_ms", rename = "optimistic_ttl_ms")]
    pub optimistic_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            persist: true,
            default_ttl: Duration::from_secs(5 * 60),
            optimistic_ttl: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Root of the remote API. Endpoints are resolved against it.
    pub base_url: Option<Url>,
}

/// Top-level configuration of the offline core.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub storage: StorageConfig,
    pub sync: SyncConfig,
    pub cache: CacheConfig,
    pub transport: TransportConfig,
}

impl CoreConfig {
    /// In-memory configuration, nothing is persisted.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Configuration persisting to `path` with the `local` backend.
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self {
            storage: StorageConfig {
                backend: "local".to_string(),
                path: Some(path.into()),
            },
            ..Default::default()
        }
    }

    /// Set the API base URL.
    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.transport.base_url = Some(base_url);
        self
    }

    /// Check the configuration for values the core cannot run with.
    ///
    /// # Errors
    /// - Unknown backend, or `local` without a path
    /// - Zero attempt ceiling, request timeout or ttl
    /// - Backoff that shrinks or starts above its cap
    pub fn validate(&self) -> Result<()> {
        let kind: BackendKind = self.storage.backend.parse()?;
        if kind.requires_path() && self.storage.path.is_none() {
            return Err(Error::Config(
                "The local storage backend requires a path".to_string(),
            ));
        }
        if self.sync.max_attempts == 0 {
            return Err(Error::Config("sync.max_attempts must be at least 1".to_string()));
        }
        if self.sync.request_timeout.is_zero() {
            return Err(Error::Config("sync.request_timeout_ms must be positive".to_string()));
        }
        let retry = &self.sync.retry;
        if retry.backoff_multiplier.is_nan() || retry.backoff_multiplier < 1.0 {
            return Err(Error::Config(
                "sync.retry.backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        if retry.initial_delay > retry.max_delay {
            return Err(Error::Config(
                "sync.retry.initial_delay_ms exceeds max_delay_ms".to_string(),
            ));
        }
        if self.cache.default_ttl.is_zero() || self.cache.optimistic_ttl.is_zero() {
            return Err(Error::Config("Cache ttls must be positive".to_string()));
        }
        Ok(())
    }

    /// Open the configured storage backend.
    pub fn open_backend(&self) -> Result<Arc<dyn StorageBackend>> {
        let kind: BackendKind = self.storage.backend.parse()?;
        kind.open(self.storage.path.as_deref())
    }

    /// Serialize configuration to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize configuration from JSON. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(format!("Invalid configuration: {}", e)))
    }

    /// Load and validate a configuration file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_json(&json)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration, creating parent directories.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, self.to_json()?).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = CoreConfig::default();
        config.validate().unwrap();
        assert_eq!(config.storage.backend, "memory");
        assert_eq!(config.sync.max_attempts, 5);
        assert_eq!(config.open_backend().unwrap().name(), "memory");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = CoreConfig::from_json(
            r#"{
                "storage": {"backend": "local", "path": "/var/lib/offsync"},
                "sync": {"max_attempts": 3, "retry": {"jitter": false}},
                "transport": {"base_url": "https://api.example.com/v2/"}
            }"#,
        )
        .unwrap();

        config.validate().unwrap();
        assert_eq!(config.sync.max_attempts, 3);
        assert_eq!(config.sync.request_timeout, Duration::from_secs(30));
        assert!(!config.sync.retry.jitter);
        assert!(config.cache.persist);
        assert_eq!(config.storage.path, Some(PathBuf::from("/var/lib/offsync")));
        assert_eq!(
            config.transport.base_url.unwrap().as_str(),
            "https://api.example.com/v2/"
        );
    }

    #[test]
    fn test_validation_failures() {
        let mut config = CoreConfig::default();
        config.storage.backend = "local".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = CoreConfig::default();
        config.storage.backend = "sqlite".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = CoreConfig::default();
        config.sync.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = CoreConfig::default();
        config.sync.retry.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = CoreConfig::default();
        config.sync.retry.initial_delay = Duration::from_secs(600);
        assert!(config.validate().is_err());

        let mut config = CoreConfig::default();
        config.cache.default_ttl = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(matches!(
            CoreConfig::from_json("{\"sync\": 5}"),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join(CONFIG_FILENAME);

        let config = CoreConfig::local(temp.path().join("data"))
            .with_base_url(Url::parse("https://api.example.com").unwrap());
        config.save(&path).await.unwrap();

        let loaded = CoreConfig::load(&path).await.unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let temp = TempDir::new().unwrap();
        let result = CoreConfig::load(temp.path().join("absent.json")).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
