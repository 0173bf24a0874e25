//! Time-bounded cache for catalog scans.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tracing::debug;

/// A cached value with the time it was stored.
#[derive(Clone, Debug)]
pub struct CacheEntry<V> {
    pub value: V,
    pub stored_at: Instant,
}

/// Key → snapshot cache with a fixed time-to-live.
///
/// Readers share the lock; the loader in [`TtlCache::get_or_refresh`] runs
/// without holding it, so a slow catalog scan only blocks writers for the
/// final swap.
#[derive(Debug)]
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: RwLock<HashMap<K, CacheEntry<V>>>,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the value if it is younger than the TTL.
    pub fn get(&self, key: &K) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    fn get_at(&self, key: &K, now: Instant) -> Option<V> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(key)
            .filter(|e| now.saturating_duration_since(e.stored_at) < self.ttl)
            .map(|e| e.value.clone())
    }

    pub fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            key,
            CacheEntry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, key: &K) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
    }

    pub fn clear(&self) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.clear();
    }

    /// Returns the cached value, or runs `load` and caches its result.
    ///
    /// A failed load is returned as-is and leaves any previous entry untouched.
    pub fn get_or_refresh<E>(&self, key: K, load: impl FnOnce() -> Result<V, E>) -> Result<V, E> {
        if let Some(v) = self.get(&key) {
            return Ok(v);
        }
        debug!(ttl_secs = self.ttl.as_secs(), "cache miss, refreshing");
        let value = load()?;
        self.insert(key, value.clone());
        Ok(value)
    }
}
