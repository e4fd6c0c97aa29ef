//! Offline-first data layer.
//!
//! Wires storage, cache, queue, sync engine and scheduler together behind
//! [`OfflineCore`], with its lifecycle defined by `init` and `dispose`.

pub mod config;
pub mod offline;

pub use config::{CacheConfig, CoreConfig, StorageConfig, TransportConfig, CONFIG_FILENAME};
pub use offline::{OfflineCore, OfflineCoreBuilder};
