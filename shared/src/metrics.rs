use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct DeliveryMetrics {
    // Admission
    pub admitted: AtomicU64,
    pub rate_limited: AtomicU64,

    // Inbound
    pub events_admitted: AtomicU64,
    pub duplicates_suppressed: AtomicU64,
    pub malformed_dropped: AtomicU64,

    // Cache
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub cache_evictions: AtomicU64,

    // Reconciliation
    pub provisional_confirmed: AtomicU64,
    pub provisional_failed: AtomicU64,
    pub provisional_evicted: AtomicU64,

    // Push delivery
    pub pushes_enqueued: AtomicU64,
    pub pushes_collapsed: AtomicU64,
    pub pushes_dispatched: AtomicU64,
}

impl DeliveryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            admitted: self.admitted.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            events_admitted: self.events_admitted.load(Ordering::Relaxed),
            duplicates_suppressed: self.duplicates_suppressed.load(Ordering::Relaxed),
            malformed_dropped: self.malformed_dropped.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_evictions: self.cache_evictions.load(Ordering::Relaxed),
            provisional_confirmed: self.provisional_confirmed.load(Ordering::Relaxed),
            provisional_failed: self.provisional_failed.load(Ordering::Relaxed),
            provisional_evicted: self.provisional_evicted.load(Ordering::Relaxed),
            pushes_enqueued: self.pushes_enqueued.load(Ordering::Relaxed),
            pushes_collapsed: self.pushes_collapsed.load(Ordering::Relaxed),
            pushes_dispatched: self.pushes_dispatched.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub admitted: u64,
    pub rate_limited: u64,
    pub events_admitted: u64,
    pub duplicates_suppressed: u64,
    pub malformed_dropped: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_evictions: u64,
    pub provisional_confirmed: u64,
    pub provisional_failed: u64,
    pub provisional_evicted: u64,
    pub pushes_enqueued: u64,
    pub pushes_collapsed: u64,
    pub pushes_dispatched: u64,
}
