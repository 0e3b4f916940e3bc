use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, trace};

use crate::clock::{Clock, UnixTimeMs};
use crate::config::CacheConfig;
use crate::metrics::DeliveryMetrics;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub value: String,
    pub inserted_at: UnixTimeMs,
    /// Content kind, e.g. `"rendered"` or `"media"`.
    pub tag: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Oldest-inserted first.
    pub entries: Vec<CacheEntry>,
}

struct CacheState {
    // Only peek/peek_mut/push/pop are used: reads never promote, so the
    // LRU order is the insertion order.
    entries: LruCache<String, CacheEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Fixed-capacity cache with insertion-order eviction and lazy TTL expiry.
///
/// Used for rendered message content and resolved media URLs. Overwriting a
/// key refreshes its value and timestamp but keeps its eviction position.
pub struct BoundedCache {
    state: Mutex<CacheState>,
    capacity: NonZeroUsize,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    metrics: Arc<DeliveryMetrics>,
}

impl BoundedCache {
    pub fn new(config: &CacheConfig, clock: Arc<dyn Clock>, metrics: Arc<DeliveryMetrics>) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Mutex::new(CacheState {
                entries: LruCache::new(capacity),
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            capacity,
            ttl: config.ttl(),
            clock,
            metrics,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        // Every critical section leaves the state consistent, so a panic
        // elsewhere does not invalidate it.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_expired(&self, entry: &CacheEntry, now: UnixTimeMs) -> bool {
        now.since(entry.inserted_at) > self.ttl
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.get_entry(key).map(|entry| entry.value)
    }

    /// Full entry for `key`, or `None` if missing or older than the TTL.
    pub fn get_entry(&self, key: &str) -> Option<CacheEntry> {
        let now = self.clock.now();
        let mut state = self.lock();

        let lookup = state
            .entries
            .peek(key)
            .map(|entry| (self.is_expired(entry, now), entry.clone()));

        match lookup {
            Some((false, entry)) => {
                state.hits += 1;
                DeliveryMetrics::incr(&self.metrics.cache_hits);
                trace!(key, "Cache HIT");
                Some(entry)
            }
            Some((true, _)) => {
                state.entries.pop(key);
                state.misses += 1;
                DeliveryMetrics::incr(&self.metrics.cache_misses);
                trace!(key, "Cache EXPIRED");
                None
            }
            None => {
                state.misses += 1;
                DeliveryMetrics::incr(&self.metrics.cache_misses);
                trace!(key, "Cache MISS");
                None
            }
        }
    }

    pub fn put(&self, key: impl Into<String>, value: impl Into<String>, tag: impl Into<String>) {
        let key = key.into();
        let entry = CacheEntry {
            key: key.clone(),
            value: value.into(),
            inserted_at: self.clock.now(),
            tag: tag.into(),
        };

        let mut state = self.lock();
        if let Some(existing) = state.entries.peek_mut(&key) {
            *existing = entry;
            return;
        }

        if let Some((evicted_key, _)) = state.entries.push(key, entry) {
            state.evictions += 1;
            DeliveryMetrics::incr(&self.metrics.cache_evictions);
            debug!(key = %evicted_key, "Cache EVICT (capacity reached)");
        }
    }

    pub fn remove(&self, key: &str) -> Option<CacheEntry> {
        self.lock().entries.pop(key)
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        let removed = state.entries.len();
        state.entries.clear();
        debug!(removed, "Cache CLEAR");
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            size: state.entries.len(),
            capacity: self.capacity.get(),
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            // LruCache iterates most-recent first.
            entries: state.entries.iter().rev().map(|(_, e)| e.clone()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use proptest::prelude::*;

    fn cache(capacity: usize, ttl_ms: u64) -> (BoundedCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(UnixTimeMs(1_000)));
        let config = CacheConfig { capacity, ttl_ms };
        let cache = BoundedCache::new(&config, clock.clone(), Arc::new(DeliveryMetrics::new()));
        (cache, clock)
    }

    #[test]
    fn test_put_and_get() {
        let (cache, _clock) = cache(4, 1_000);
        cache.put("msg:1", "<p>hi</p>", "rendered");
        assert_eq!(cache.get("msg:1").as_deref(), Some("<p>hi</p>"));
        assert_eq!(cache.get("msg:2"), None);

        let entry = cache.get_entry("msg:1").unwrap();
        assert_eq!(entry.tag, "rendered");
        assert_eq!(entry.inserted_at, UnixTimeMs(1_000));
    }

    #[test]
    fn test_capacity_plus_one_evicts_first_inserted() {
        let (cache, _clock) = cache(3, 60_000);
        for key in ["a", "b", "c", "d"] {
            cache.put(key, key, "media");
        }

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get("a"), None);
        for key in ["b", "c", "d"] {
            assert!(cache.get(key).is_some());
        }
    }

    #[test]
    fn test_reads_do_not_change_eviction_order() {
        let (cache, _clock) = cache(2, 60_000);
        cache.put("a", "1", "t");
        cache.put("b", "2", "t");

        // An LRU would now evict "b"; FIFO still evicts "a".
        assert!(cache.get("a").is_some());
        cache.put("c", "3", "t");

        assert_eq!(cache.get("a"), None);
        assert!(cache.get("b").is_some());
    }

    #[test]
    fn test_overwrite_keeps_position_and_refreshes_value() {
        let (cache, clock) = cache(2, 60_000);
        cache.put("a", "1", "t");
        cache.put("b", "2", "t");

        clock.advance(Duration::from_millis(10));
        cache.put("a", "1b", "t2");
        assert_eq!(cache.len(), 2);
        let entry = cache.get_entry("a").unwrap();
        assert_eq!(entry.value, "1b");
        assert_eq!(entry.tag, "t2");
        assert_eq!(entry.inserted_at, UnixTimeMs(1_010));

        cache.put("c", "3", "t");
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b").as_deref(), Some("2"));
    }

    #[test]
    fn test_expired_entries_read_as_absent_and_are_removed() {
        let (cache, clock) = cache(4, 100);
        cache.put("a", "1", "t");

        clock.advance(Duration::from_millis(100));
        assert!(cache.get("a").is_some());

        clock.advance(Duration::from_millis(1));
        assert_eq!(cache.get("a"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_stats_lists_oldest_first() {
        let (cache, _clock) = cache(3, 60_000);
        cache.put("x", "1", "t");
        cache.put("y", "2", "t");
        cache.get("x");
        cache.get("missing");

        let stats = cache.stats();
        assert_eq!(stats.size, 2);
        assert_eq!(stats.capacity, 3);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        let keys: Vec<_> = stats.entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["x", "y"]);
    }

    #[test]
    fn test_clear_and_remove() {
        let (cache, _clock) = cache(3, 60_000);
        cache.put("x", "1", "t");
        cache.put("y", "2", "t");

        assert_eq!(cache.remove("x").map(|e| e.value).as_deref(), Some("1"));
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.stats().entries, vec![]);
    }

    #[test]
    fn test_concurrent_puts_respect_capacity() {
        let (cache, _clock) = cache(32, 60_000);
        std::thread::scope(|s| {
            for t in 0..8 {
                let cache = &cache;
                s.spawn(move || {
                    for i in 0..200 {
                        cache.put(format!("{t}-{i}"), "v", "t");
                        cache.get(&format!("{t}-{}", i / 2));
                    }
                });
            }
        });
        assert_eq!(cache.len(), 32);
        assert_eq!(cache.stats().evictions, 8 * 200 - 32);
    }

    proptest! {
        #[test]
        fn size_never_exceeds_capacity(
            capacity in 1usize..16,
            keys in proptest::collection::vec(0u8..40, 0..100),
        ) {
            let (cache, _clock) = cache(capacity, 60_000);
            for key in &keys {
                cache.put(key.to_string(), "v", "t");
                prop_assert!(cache.len() <= capacity);
            }
        }
    }
}
