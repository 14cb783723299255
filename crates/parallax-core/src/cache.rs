//! LRU cache of broker addresses.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

/// Cache sizing parameters.
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// Maximum number of entries.
    pub max: usize,
    /// Maximum entry age before it is treated as absent.
    pub max_age: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max: 2048,
            max_age: Duration::from_secs(60),
        }
    }
}

struct Entry {
    addr: String,
    inserted: Instant,
}

/// Thread-safe LRU cache mapping worker ids to broker addresses.
///
/// Entries older than `max_age` are evicted on lookup. A hit avoids a
/// registry round-trip on the ask/tell path; the caller evicts on routing
/// failure so a stale owner never sticks.
pub struct AddressCache {
    inner: Mutex<LruCache<String, Entry>>,
    max_age: Duration,
}

impl AddressCache {
    /// Creates a cache with the given sizing.
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        let cap = NonZeroUsize::new(config.max).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(cap)),
            max_age: config.max_age,
        }
    }

    /// Looks up the cached address for a worker, refreshing its recency.
    #[must_use]
    pub fn get(&self, worker_id: &str) -> Option<String> {
        let mut cache = self.inner.lock();
        match cache.get(worker_id) {
            Some(entry) if entry.inserted.elapsed() <= self.max_age => Some(entry.addr.clone()),
            Some(_) => {
                cache.pop(worker_id);
                None
            }
            None => None,
        }
    }

    /// Inserts or replaces the address for a worker.
    pub fn insert(&self, worker_id: impl Into<String>, addr: impl Into<String>) {
        self.inner.lock().put(
            worker_id.into(),
            Entry {
                addr: addr.into(),
                inserted: Instant::now(),
            },
        );
    }

    /// Removes a worker's entry, if present.
    pub fn remove(&self, worker_id: &str) {
        self.inner.lock().pop(worker_id);
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Returns the number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Returns true if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl std::fmt::Debug for AddressCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressCache")
            .field("len", &self.len())
            .field("max_age", &self.max_age)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_cache(max: usize, max_age: Duration) -> AddressCache {
        AddressCache::new(CacheConfig { max, max_age })
    }

    #[test]
    fn insert_and_get() {
        let cache = make_cache(4, Duration::from_secs(60));
        cache.insert("w1", "10.0.0.1:7000");
        assert_eq!(cache.get("w1").as_deref(), Some("10.0.0.1:7000"));
        assert_eq!(cache.get("w2"), None);
    }

    #[test]
    fn capacity_evicts_least_recent() {
        let cache = make_cache(2, Duration::from_secs(60));
        cache.insert("w1", "a");
        cache.insert("w2", "b");
        // Touch w1 so w2 becomes the eviction candidate.
        let _ = cache.get("w1");
        cache.insert("w3", "c");

        assert!(cache.get("w1").is_some());
        assert!(cache.get("w2").is_none());
        assert!(cache.get("w3").is_some());
    }

    #[test]
    fn max_age_expires_entries() {
        let cache = make_cache(4, Duration::ZERO);
        cache.insert("w1", "a");
        assert_eq!(cache.get("w1"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn remove_and_clear() {
        let cache = make_cache(4, Duration::from_secs(60));
        cache.insert("w1", "a");
        cache.insert("w2", "b");

        cache.remove("w1");
        assert!(cache.get("w1").is_none());

        cache.clear();
        assert!(cache.is_empty());
    }
}
