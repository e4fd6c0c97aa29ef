//! Read cache for the offline sync core.
//!
//! Holds locally cached API responses so screens can render without
//! connectivity. Entries carry the ttl they were written with, but each read
//! chooses its own maximum age.

pub mod entry;
pub mod store;

pub use entry::{CacheEntry, CacheKeyStats, CacheSnapshot, CacheStats, CachedValue};
pub use store::{CacheStore, CACHE_STORE_KEY};
