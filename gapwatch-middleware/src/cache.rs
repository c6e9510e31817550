//! TTL-keyed store for provider results.
//!
//! Entries live in an LRU-bounded memory tier. When a path is configured the
//! whole store is mirrored to a JSON file on every write and restored on open.
//! The mirror is serialized under the cache lock and written after releasing it.

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use gapwatch_core::{CacheConfig, Clock, GapwatchError, SystemClock};
use lru::LruCache;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};

use crate::snapshot::SnapshotFile;

/// One cached payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Lookup key.
    pub key: String,
    /// Cached value.
    pub payload: serde_json::Value,
    /// When the entry was written.
    pub created_at: DateTime<Utc>,
    /// Lifetime in milliseconds.
    pub ttl_ms: u64,
}

impl CacheEntry {
    /// `now - created_at > ttl`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let ttl = TimeDelta::milliseconds(i64::try_from(self.ttl_ms).unwrap_or(i64::MAX));
        now.signed_duration_since(self.created_at) > ttl
    }
}

/// Counters describing cache effectiveness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Entries currently held (expired ones included until evicted).
    pub entries: usize,
    /// Successful lookups.
    pub hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// Lookups or sweeps that found an expired entry.
    pub expired: u64,
}

/// Build a cache key from a namespace and parts, e.g. `quote:AAPL`.
#[must_use]
pub fn cache_key(namespace: &str, parts: &[&str]) -> String {
    let mut k = String::from(namespace);
    for p in parts {
        k.push(':');
        k.push_str(p);
    }
    k
}

/// TTL cache with an optional durable JSON mirror.
pub struct TtlCache {
    inner: Mutex<LruCache<String, CacheEntry>>,
    mirror: Option<SnapshotFile>,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
}

impl std::fmt::Debug for TtlCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCache")
            .field("path", &self.mirror.as_ref().map(SnapshotFile::path))
            .finish_non_exhaustive()
    }
}

impl TtlCache {
    /// In-memory cache holding at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(cap)),
            mirror: None,
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    /// In-memory cache on the system clock.
    #[must_use]
    pub fn in_memory(capacity: usize) -> Self {
        Self::new(capacity, Arc::new(SystemClock))
    }

    /// Cache mirrored to `path`. Unexpired entries found there are restored.
    ///
    /// # Errors
    /// Returns `GapwatchError::Persistence` if an existing file cannot be read or decoded.
    pub fn open(
        path: impl AsRef<Path>,
        capacity: usize,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, GapwatchError> {
        let path = path.as_ref().to_path_buf();
        let mut cache = Self::new(capacity, clock);
        let restored: Vec<CacheEntry> = match std::fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => Vec::new(),
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| GapwatchError::persistence(&path, e))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(GapwatchError::persistence(&path, e)),
        };
        let now = cache.clock.now();
        {
            let lru = cache.inner.get_mut();
            for entry in restored.into_iter().filter(|e| !e.is_expired(now)) {
                lru.put(entry.key.clone(), entry);
            }
            tracing::debug!(path = %path.display(), restored = lru.len(), "cache restored");
        }
        cache.mirror = Some(SnapshotFile::new(path));
        Ok(cache)
    }

    /// Build from configuration.
    ///
    /// # Errors
    /// See [`TtlCache::open`].
    pub fn from_config(cfg: &CacheConfig, clock: Arc<dyn Clock>) -> Result<Self, GapwatchError> {
        match cfg.path.as_ref() {
            Some(p) => Self::open(p, cfg.max_entries, clock),
            None => Ok(Self::new(cfg.max_entries, clock)),
        }
    }

    /// Raw lookup. Expired entries are evicted and reported as misses.
    pub async fn get_value(&self, key: &str) -> Option<serde_json::Value> {
        let now = self.clock.now();
        let mut guard = self.inner.lock().await;
        let found = guard
            .get(key)
            .map(|e| (!e.is_expired(now)).then(|| e.payload.clone()));
        match found {
            Some(Some(payload)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(payload)
            }
            Some(None) => {
                guard.pop(key);
                self.expired.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Typed lookup. A payload that no longer decodes is treated as a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let v = self.get_value(key).await?;
        match serde_json::from_value(v) {
            Ok(t) => Some(t),
            Err(e) => {
                tracing::warn!(key, error = %e, "discarding undecodable cache entry");
                None
            }
        }
    }

    /// Raw insert with a per-entry TTL.
    pub async fn set_value(&self, key: impl Into<String>, payload: serde_json::Value, ttl: Duration) {
        let key = key.into();
        let entry = CacheEntry {
            key: key.clone(),
            payload,
            created_at: self.clock.now(),
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
        };
        let mut guard = self.inner.lock().await;
        guard.put(key, entry);
        self.mirror(guard);
    }

    /// Typed insert. Values that fail to serialize are skipped with a warning.
    pub async fn set<T: Serialize + ?Sized>(&self, key: impl Into<String>, value: &T, ttl: Duration) {
        match serde_json::to_value(value) {
            Ok(v) => self.set_value(key, v, ttl).await,
            Err(e) => tracing::warn!(error = %e, "value not cacheable"),
        }
    }

    /// Remove one entry; returns whether it existed.
    pub async fn remove(&self, key: &str) -> bool {
        let mut guard = self.inner.lock().await;
        let existed = guard.pop(key).is_some();
        if existed {
            self.mirror(guard);
        }
        existed
    }

    /// Drop every entry.
    pub async fn clear(&self) {
        let mut guard = self.inner.lock().await;
        guard.clear();
        self.mirror(guard);
    }

    /// Evict every expired entry; returns how many were removed.
    pub async fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        let mut guard = self.inner.lock().await;
        let stale: Vec<String> = guard
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for k in &stale {
            guard.pop(k);
        }
        let removed = stale.len();
        if removed > 0 {
            self.expired.fetch_add(removed as u64, Ordering::Relaxed);
            self.mirror(guard);
        }
        removed
    }

    /// Current counters.
    pub async fn stats(&self) -> CacheStats {
        let entries = self.inner.lock().await.len();
        CacheStats {
            entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }

    fn mirror(&self, lru: MutexGuard<'_, LruCache<String, CacheEntry>>) {
        let Some(file) = self.mirror.as_ref() else {
            return;
        };
        let serialized = {
            let entries: Vec<&CacheEntry> = lru.iter().map(|(_, e)| e).collect();
            serde_json::to_vec(&entries)
        };
        let body = match serialized {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize cache mirror");
                return;
            }
        };
        let seq = file.stamp();
        drop(lru);
        if let Err(e) = file.write(seq, &body) {
            tracing::warn!(error = %e, "failed to mirror cache to disk");
        }
    }
}
