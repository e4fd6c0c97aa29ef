//! TTL-aware read cache.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use offsync_common::{Clock, Result, SystemClock};
use offsync_storage::{load_json, store_json, StorageBackend};

use crate::entry::{CacheEntry, CacheKeyStats, CacheSnapshot, CacheStats, CachedValue};

/// Name of the persisted cache blob.
pub const CACHE_STORE_KEY: &str = "cacheStore";

/// Keyed store of read results.
///
/// Freshness is decided at read time against the `max_age` each caller
/// passes, so one entry can serve a list view that tolerates old data and a
/// balance check that does not. When opened on a backend, every mutation is
/// written through before it returns.
pub struct CacheStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
    backend: Option<Arc<dyn StorageBackend>>,
    clock: Arc<dyn Clock>,
}

impl CacheStore {
    /// Create a non-persistent cache.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            backend: None,
            clock,
        }
    }

    /// Open a persistent cache, loading any previously saved entries.
    ///
    /// An unreadable cache blob is discarded with a warning; the cache is a
    /// disposable copy of server data and must never block startup.
    pub async fn open(backend: Arc<dyn StorageBackend>, clock: Arc<dyn Clock>) -> Result<Self> {
        let entries = match load_json::<HashMap<String, CacheEntry>>(backend.as_ref(), CACHE_STORE_KEY).await {
            Ok(Some(entries)) => entries,
            Ok(None) => HashMap::new(),
            Err(e) => {
                warn!("Discarding unreadable cache store: {}", e);
                HashMap::new()
            }
        };

        info!("Opened cache with {} entries ({} backend)", entries.len(), backend.name());

        Ok(Self {
            entries: RwLock::new(entries),
            backend: Some(backend),
            clock,
        })
    }

    /// Whether mutations are written to a backend.
    pub fn is_persistent(&self) -> bool {
        self.backend.is_some()
    }

    /// Read `key` if it was written less than `max_age` ago.
    ///
    /// Returns `None` on a miss or when the entry is too old. Never errors.
    pub async fn get(&self, key: &str, max_age: Duration) -> Option<Value> {
        let now = self.clock.now();
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(entry) if entry.is_within(max_age, now) => Some(entry.value.clone()),
            Some(_) => {
                debug!("Cache entry {} older than {:?}", key, max_age);
                None
            }
            None => None,
        }
    }

    /// Typed variant of [`get`](Self::get). A payload of the wrong shape reads as a miss.
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str, max_age: Duration) -> Option<T> {
        let value = self.get(key, max_age).await?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("Cache entry {} has unexpected shape: {}", key, e);
                None
            }
        }
    }

    /// Read `key` regardless of age, flagged stale against its own ttl.
    pub async fn get_entry(&self, key: &str) -> Option<CachedValue> {
        let now = self.clock.now();
        let entries = self.entries.read().await;
        entries.get(key).map(|entry| CachedValue {
            value: entry.value.clone(),
            saved_at: entry.saved_at,
            age: entry.age(now),
            stale: !entry.is_fresh(now),
        })
    }

    /// Store `value` under `key`, replacing any previous entry.
    ///
    /// If the write-through fails the previous entry is kept.
    pub async fn set(&self, key: impl Into<String>, value: Value, ttl: Duration) -> Result<()> {
        let key = key.into();
        let entry = CacheEntry::new(key.clone(), value, ttl, self.clock.now());

        let mut entries = self.entries.write().await;
        let previous = entries.insert(key.clone(), entry);
        if let Err(e) = self.persist(&entries).await {
            put_back(&mut entries, key, previous);
            return Err(e);
        }
        Ok(())
    }

    /// Remove `key`. Returns whether an entry was present.
    pub async fn remove(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.write().await;
        let Some(removed) = entries.remove(key) else {
            return Ok(false);
        };
        if let Err(e) = self.persist(&entries).await {
            entries.insert(key.to_string(), removed);
            return Err(e);
        }
        Ok(true)
    }

    /// Remove several keys at once. Returns how many were present.
    pub async fn invalidate<S: AsRef<str>>(&self, keys: &[S]) -> Result<usize> {
        let mut entries = self.entries.write().await;
        let removed: Vec<(String, CacheEntry)> = keys
            .iter()
            .filter_map(|key| {
                let key: &str = key.as_ref();
                entries.remove_entry(key)
            })
            .collect();
        if removed.is_empty() {
            return Ok(0);
        }
        if let Err(e) = self.persist(&entries).await {
            entries.extend(removed);
            return Err(e);
        }
        Ok(removed.len())
    }

    /// Remove every entry.
    pub async fn clear(&self) -> Result<()> {
        let mut entries = self.entries.write().await;
        let previous = std::mem::take(&mut *entries);
        if let Err(e) = self.persist(&entries).await {
            *entries = previous;
            return Err(e);
        }
        info!("Cleared {} cache entries", previous.len());
        Ok(())
    }

    /// Drop entries written `max_age` ago or earlier. Returns how many were dropped.
    pub async fn purge_expired(&self, max_age: Duration) -> Result<usize> {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let expired: Vec<String> = entries
            .values()
            .filter(|entry| !entry.is_within(max_age, now))
            .map(|entry| entry.key.clone())
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }

        let purged: Vec<(String, CacheEntry)> = expired
            .iter()
            .filter_map(|key| entries.remove_entry(key))
            .collect();
        if let Err(e) = self.persist(&entries).await {
            entries.extend(purged);
            return Err(e);
        }
        debug!("Purged {} expired cache entries", purged.len());
        Ok(purged.len())
    }

    /// Capture the current state of `key`, ignoring freshness.
    pub async fn snapshot(&self, key: &str) -> CacheSnapshot {
        let entries = self.entries.read().await;
        CacheSnapshot::new(key, entries.get(key).cloned())
    }

    /// Put a captured slot back exactly as it was, including its write time.
    pub async fn restore(&self, snapshot: CacheSnapshot) -> Result<()> {
        let (key, entry) = snapshot.into_parts();
        let mut entries = self.entries.write().await;
        let previous = match entry {
            Some(entry) => entries.insert(key.clone(), entry),
            None => entries.remove(&key),
        };
        if let Err(e) = self.persist(&entries).await {
            put_back(&mut entries, key, previous);
            return Err(e);
        }
        Ok(())
    }

    /// Size and age of every entry.
    pub async fn stats(&self) -> CacheStats {
        let now = self.clock.now();
        let entries = self.entries.read().await;

        let mut per_key: Vec<CacheKeyStats> = entries
            .values()
            .map(|entry| CacheKeyStats {
                key: entry.key.clone(),
                age_ms: entry.age(now).as_millis().min(u64::MAX as u128) as u64,
                size_bytes: entry.size_bytes(),
            })
            .collect();
        per_key.sort_by(|a, b| a.key.cmp(&b.key));

        CacheStats {
            count: per_key.len(),
            total_size: per_key.iter().map(|s| s.size_bytes).sum(),
            per_key,
        }
    }

    /// Whether `key` is present, regardless of age.
    pub async fn contains(&self, key: &str) -> bool {
        self.entries.read().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Persist the map. Called with the write lock held so writes never interleave.
    async fn persist(&self, entries: &HashMap<String, CacheEntry>) -> Result<()> {
        if let Some(backend) = &self.backend {
            store_json(backend.as_ref(), CACHE_STORE_KEY, entries).await?;
        }
        Ok(())
    }
}

fn put_back(entries: &mut HashMap<String, CacheEntry>, key: String, previous: Option<CacheEntry>) {
    match previous {
        Some(entry) => {
            entries.insert(key, entry);
        }
        None => {
            entries.remove(&key);
        }
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::in_memory(Arc::new(SystemClock))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offsync_common::ManualClock;
    use offsync_storage::{LocalBackend, MemoryBackend};
    use serde_json::json;
    use tempfile::TempDir;

    fn cache_with_clock() -> (CacheStore, ManualClock) {
        let clock = ManualClock::default();
        (CacheStore::in_memory(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (cache, _clock) = cache_with_clock();
        let ttl = Duration::from_secs(60);
        cache.set("events", json!([1, 2, 3]), ttl).await.unwrap();
        assert_eq!(cache.get("events", ttl).await, Some(json!([1, 2, 3])));
    }

    #[tokio::test]
    async fn test_miss_returns_none() {
        let (cache, _clock) = cache_with_clock();
        assert!(cache.get("nothing", Duration::from_secs(1)).await.is_none());
        assert!(cache.get_entry("nothing").await.is_none());
    }

    #[tokio::test]
    async fn test_caller_chosen_max_age() {
        let (cache, clock) = cache_with_clock();
        cache
            .set("x", json!(42), Duration::from_millis(1000))
            .await
            .unwrap();

        clock.advance(Duration::from_millis(1500));

        assert!(cache.get("x", Duration::from_millis(1000)).await.is_none());
        assert_eq!(cache.get("x", Duration::from_millis(2000)).await, Some(json!(42)));
    }

    #[tokio::test]
    async fn test_max_age_shorter_than_ttl() {
        let (cache, clock) = cache_with_clock();
        cache
            .set("balance", json!(100), Duration::from_secs(3600))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(30));
        assert!(cache.get("balance", Duration::from_secs(30)).await.is_none());
        assert!(cache.get("balance", Duration::from_secs(31)).await.is_some());
    }

    #[tokio::test]
    async fn test_stale_entries_stay_readable() {
        let (cache, clock) = cache_with_clock();
        cache.set("list", json!(["a"]), Duration::from_secs(10)).await.unwrap();

        let fresh = cache.get_entry("list").await.unwrap();
        assert!(!fresh.stale);

        clock.advance(Duration::from_secs(11));
        let stale = cache.get_entry("list").await.unwrap();
        assert!(stale.stale);
        assert_eq!(stale.value, json!(["a"]));
        assert_eq!(stale.age, Duration::from_secs(11));
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let (cache, _clock) = cache_with_clock();
        cache.set("k", json!(1), Duration::from_secs(5)).await.unwrap();
        cache.set("k", json!(2), Duration::from_secs(5)).await.unwrap();
        assert_eq!(cache.get("k", Duration::from_secs(5)).await, Some(json!(2)));
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_get_as_typed() {
        let (cache, _clock) = cache_with_clock();
        cache.set("n", json!(7), Duration::from_secs(5)).await.unwrap();
        assert_eq!(cache.get_as::<u32>("n", Duration::from_secs(5)).await, Some(7));
        assert_eq!(cache.get_as::<String>("n", Duration::from_secs(5)).await, None);
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let (cache, _clock) = cache_with_clock();
        cache.set("a", json!(1), Duration::from_secs(5)).await.unwrap();
        cache.set("b", json!(2), Duration::from_secs(5)).await.unwrap();

        cache.clear().await.unwrap();
        assert!(cache.is_empty().await);
        cache.clear().await.unwrap();
        assert!(cache.is_empty().await);
        assert_eq!(cache.stats().await, CacheStats::default());
    }

    #[tokio::test]
    async fn test_remove_and_invalidate() {
        let (cache, _clock) = cache_with_clock();
        for key in ["a", "b", "c"] {
            cache.set(key, json!(key), Duration::from_secs(5)).await.unwrap();
        }

        assert!(cache.remove("a").await.unwrap());
        assert!(!cache.remove("a").await.unwrap());
        assert_eq!(cache.invalidate(&["b", "zzz"]).await.unwrap(), 1);
        assert!(cache.contains("c").await);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_stats() {
        let (cache, clock) = cache_with_clock();
        cache.set("b", json!("xy"), Duration::from_secs(5)).await.unwrap();
        clock.advance(Duration::from_millis(250));
        cache.set("a", json!(1), Duration::from_secs(5)).await.unwrap();

        let stats = cache.stats().await;
        assert_eq!(stats.count, 2);
        assert_eq!(stats.total_size, 5);
        assert_eq!(stats.per_key[0].key, "a");
        assert_eq!(stats.per_key[0].age_ms, 0);
        assert_eq!(stats.per_key[1].age_ms, 250);
        assert_eq!(stats.per_key[1].size_bytes, 4);
    }

    #[tokio::test]
    async fn test_snapshot_and_restore() {
        let (cache, clock) = cache_with_clock();
        cache.set("sale", json!({"qty": 1}), Duration::from_secs(60)).await.unwrap();
        let snapshot = cache.snapshot("sale").await;
        let saved_at = snapshot.entry().unwrap().saved_at;

        clock.advance(Duration::from_secs(5));
        cache.set("sale", json!({"qty": 2}), Duration::from_secs(60)).await.unwrap();
        cache.restore(snapshot).await.unwrap();

        let restored = cache.get_entry("sale").await.unwrap();
        assert_eq!(restored.value, json!({"qty": 1}));
        assert_eq!(restored.saved_at, saved_at);
    }

    #[tokio::test]
    async fn test_restore_missing_snapshot_removes() {
        let (cache, _clock) = cache_with_clock();
        let snapshot = cache.snapshot("new-item").await;
        assert!(snapshot.value().is_none());

        cache.set("new-item", json!(true), Duration::from_secs(60)).await.unwrap();
        cache.restore(snapshot).await.unwrap();
        assert!(!cache.contains("new-item").await);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (cache, clock) = cache_with_clock();
        cache.set("old", json!(1), Duration::from_secs(5)).await.unwrap();
        clock.advance(Duration::from_secs(100));
        cache.set("new", json!(2), Duration::from_secs(5)).await.unwrap();

        assert_eq!(cache.purge_expired(Duration::from_secs(50)).await.unwrap(), 1);
        assert!(cache.contains("new").await);
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let temp = TempDir::new().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());

        {
            let backend = Arc::new(LocalBackend::new(temp.path()).unwrap());
            let cache = CacheStore::open(backend, clock.clone()).await.unwrap();
            assert!(cache.is_persistent());
            cache.set("x", json!({"v": 1}), Duration::from_secs(60)).await.unwrap();
        }

        let backend = Arc::new(LocalBackend::new(temp.path()).unwrap());
        let cache = CacheStore::open(backend, clock).await.unwrap();
        assert_eq!(cache.get("x", Duration::from_secs(60)).await, Some(json!({"v": 1})));
    }

    #[tokio::test]
    async fn test_corrupt_store_is_discarded() {
        let backend = MemoryBackend::new();
        backend
            .store(CACHE_STORE_KEY, b"not json".to_vec())
            .await
            .unwrap();

        let cache = CacheStore::open(Arc::new(backend), Arc::new(ManualClock::default()))
            .await
            .unwrap();
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_failed_write_through_keeps_memory_unchanged() {
        let backend = MemoryBackend::new();
        let clock = ManualClock::default();
        let cache = CacheStore::open(Arc::new(backend.clone()), Arc::new(clock.clone()))
            .await
            .unwrap();
        let ttl = Duration::from_secs(60);
        cache.set("likes", json!(4), ttl).await.unwrap();
        cache.set("old", json!(0), ttl).await.unwrap();
        let before = cache.get_entry("likes").await.unwrap();
        clock.advance(Duration::from_secs(120));

        backend.set_read_only(true);
        assert!(cache.set("likes", json!(5), ttl).await.is_err());
        assert!(cache.set("fresh", json!(1), ttl).await.is_err());
        assert!(cache.remove("likes").await.is_err());
        assert!(cache.invalidate(&["likes", "old"]).await.is_err());
        assert!(cache.clear().await.is_err());
        assert!(cache.purge_expired(Duration::from_secs(60)).await.is_err());
        assert!(cache.restore(CacheSnapshot::new("likes", None)).await.is_err());

        let after = cache.get_entry("likes").await.unwrap();
        assert_eq!(after.value, json!(4));
        assert_eq!(after.saved_at, before.saved_at);
        assert!(cache.contains("old").await);
        assert!(!cache.contains("fresh").await);
        assert_eq!(cache.len().await, 2);

        backend.set_read_only(false);
        let reopened = CacheStore::open(Arc::new(backend), Arc::new(clock)).await.unwrap();
        assert_eq!(reopened.get_entry("likes").await.unwrap().value, json!(4));
    }
}
