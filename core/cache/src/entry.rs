//! Cache entry, snapshot and statistics types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use offsync_common::clock::elapsed_between;

/// A cached read result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Caller-defined key.
    pub key: String,
    /// Cached payload.
    pub value: Value,
    /// When the value was written.
    pub saved_at: DateTime<Utc>,
    /// Validity window chosen by the writer, in milliseconds.
    pub ttl_ms: u64,
}

impl CacheEntry {
    /// Create an entry saved at `now`.
    pub fn new(key: impl Into<String>, value: Value, ttl: Duration, now: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            value,
            saved_at: now,
            ttl_ms: ttl.as_millis().min(u64::MAX as u128) as u64,
        }
    }

    /// Validity window chosen by the writer.
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Age of the entry at `now`.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        elapsed_between(self.saved_at, now)
    }

    /// Whether the entry is younger than `max_age`.
    pub fn is_within(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        self.age(now) < max_age
    }

    /// Fresh iff `now - saved_at < ttl`.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.is_within(self.ttl(), now)
    }

    /// Serialized size of the payload in bytes.
    pub fn size_bytes(&self) -> usize {
        serde_json::to_vec(&self.value).map(|v| v.len()).unwrap_or(0)
    }
}

/// A value read without a freshness bound, flagged with its staleness.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue {
    pub value: Value,
    pub saved_at: DateTime<Utc>,
    pub age: Duration,
    /// True once the entry outlived the ttl it was written with.
    pub stale: bool,
}

/// Immutable capture of one cache slot, used to undo optimistic writes.
///
/// A snapshot of a missing key restores to "missing".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    key: String,
    entry: Option<CacheEntry>,
}

impl CacheSnapshot {
    pub(crate) fn new(key: impl Into<String>, entry: Option<CacheEntry>) -> Self {
        Self {
            key: key.into(),
            entry,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The captured entry, if the key was present.
    pub fn entry(&self) -> Option<&CacheEntry> {
        self.entry.as_ref()
    }

    /// The captured value, ignoring freshness.
    pub fn value(&self) -> Option<&Value> {
        self.entry.as_ref().map(|e| &e.value)
    }

    pub(crate) fn into_parts(self) -> (String, Option<CacheEntry>) {
        (self.key, self.entry)
    }
}

/// Per-key cache statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheKeyStats {
    pub key: String,
    pub age_ms: u64,
    pub size_bytes: usize,
}

/// Cache introspection summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub count: usize,
    pub total_size: usize,
    /// Sorted by key.
    pub per_key: Vec<CacheKeyStats>,
}
