//! Backend selection from configuration.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use crate::local::LocalBackend;
use crate::memory::MemoryBackend;
use crate::provider::StorageBackend;
use offsync_common::{Error, Result};

/// Built-in backends, named as they appear in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Nothing survives the process.
    Memory,
    /// One JSON file per store under a directory.
    Local,
}

impl BackendKind {
    pub const ALL: [BackendKind; 2] = [BackendKind::Memory, BackendKind::Local];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Memory => "memory",
            BackendKind::Local => "local",
        }
    }

    /// Whether the backend needs a directory.
    pub fn requires_path(&self) -> bool {
        matches!(self, BackendKind::Local)
    }

    /// Open the backend. `path` is ignored by `memory`.
    ///
    /// # Errors
    /// - `local` without a path
    /// - The directory cannot be created
    pub fn open(&self, path: Option<&Path>) -> Result<Arc<dyn StorageBackend>> {
        match self {
            BackendKind::Memory => Ok(Arc::new(MemoryBackend::new())),
            BackendKind::Local => {
                let path = path.ok_or_else(|| {
                    Error::Config("The local storage backend requires a path".to_string())
                })?;
                Ok(Arc::new(LocalBackend::new(path)?))
            }
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        BackendKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s.trim())
            .ok_or_else(|| {
                let known: Vec<&str> = BackendKind::ALL.iter().map(|k| k.as_str()).collect();
                Error::Config(format!(
                    "Unknown storage backend '{}' (expected one of: {})",
                    s,
                    known.join(", ")
                ))
            })
    }
}

/// Open the backend configured by name.
pub fn open_backend(name: &str, path: Option<&Path>) -> Result<Arc<dyn StorageBackend>> {
    name.parse::<BackendKind>()?.open(path)
}
