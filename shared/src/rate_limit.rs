use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::clock::{duration_ms, Clock, UnixTimeMs};
use crate::config::RateLimitConfig;
use crate::error::DeliveryError;
use crate::metrics::DeliveryMetrics;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Bucket {
    count: u32,
    reset_at: UnixTimeMs,
}

/// Outcome of a single admission check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Allowed { remaining: u32 },
    Limited { retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed { .. })
    }

    pub fn into_result(self, key: &str) -> Result<u32, DeliveryError> {
        match self {
            Admission::Allowed { remaining } => Ok(remaining),
            Admission::Limited { retry_after } => Err(DeliveryError::RateLimited {
                key: key.to_string(),
                retry_after_ms: duration_ms(retry_after),
            }),
        }
    }
}

/// Per-key fixed-window admission control.
///
/// Each key's read-modify-write runs under that key's shard lock, so two
/// concurrent callers can never both take the last slot of a window.
pub struct RateLimiter {
    buckets: DashMap<String, Bucket>,
    clock: Arc<dyn Clock>,
    metrics: Arc<DeliveryMetrics>,
    default_window: Duration,
    default_max: u32,
    sweep_interval: Duration,
    next_sweep_ms: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig, clock: Arc<dyn Clock>, metrics: Arc<DeliveryMetrics>) -> Self {
        let next_sweep = clock.now().saturating_add(config.sweep_interval());
        Self {
            buckets: DashMap::new(),
            clock,
            metrics,
            default_window: config.window(),
            default_max: config.max_requests,
            sweep_interval: config.sweep_interval(),
            next_sweep_ms: AtomicU64::new(next_sweep.0),
        }
    }

    /// Admit or reject one request for `key`.
    pub fn admit(&self, key: &str, window: Duration, max_requests: u32) -> Admission {
        let now = self.clock.now();
        self.maybe_sweep(now);

        let decision = match self.buckets.get_mut(key) {
            Some(mut bucket) => Self::decide(&mut bucket, now, window, max_requests),
            None => {
                let mut bucket = self.buckets.entry(key.to_string()).or_insert(Bucket {
                    count: 0,
                    reset_at: now.saturating_add(window),
                });
                Self::decide(&mut bucket, now, window, max_requests)
            }
        };

        match decision {
            Admission::Allowed { .. } => DeliveryMetrics::incr(&self.metrics.admitted),
            Admission::Limited { retry_after } => {
                DeliveryMetrics::incr(&self.metrics.rate_limited);
                warn!(
                    key,
                    retry_after_ms = duration_ms(retry_after),
                    "Rate limit exceeded"
                );
            }
        }
        decision
    }

    /// [`admit`](Self::admit) with the configured window and maximum.
    pub fn check(&self, key: &str) -> Result<u32, DeliveryError> {
        self.admit(key, self.default_window, self.default_max)
            .into_result(key)
    }

    fn decide(bucket: &mut Bucket, now: UnixTimeMs, window: Duration, max_requests: u32) -> Admission {
        if now > bucket.reset_at {
            bucket.count = 0;
            bucket.reset_at = now.saturating_add(window);
        }

        if bucket.count >= max_requests {
            return Admission::Limited {
                retry_after: bucket.reset_at.since(now),
            };
        }

        bucket.count += 1;
        Admission::Allowed {
            remaining: max_requests - bucket.count,
        }
    }

    /// Purge at most once per sweep interval, from whichever caller wins the race.
    fn maybe_sweep(&self, now: UnixTimeMs) {
        let due = self.next_sweep_ms.load(Ordering::Relaxed);
        if now.0 < due {
            return;
        }
        let next = now.saturating_add(self.sweep_interval).0;
        if self
            .next_sweep_ms
            .compare_exchange(due, next, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.sweep_expired(now);
        }
    }

    /// Drop buckets whose window has passed. Returns how many were removed.
    pub fn sweep_expired(&self, now: UnixTimeMs) -> usize {
        let mut removed = 0;
        self.buckets.retain(|_, bucket| {
            let keep = now <= bucket.reset_at;
            if !keep {
                removed += 1;
            }
            keep
        });
        if removed > 0 {
            debug!(removed, remaining = self.buckets.len(), "Swept expired rate-limit buckets");
        }
        removed
    }

    /// Number of keys currently tracked.
    pub fn active_keys(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use proptest::prelude::*;

    fn limiter(start: u64) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(UnixTimeMs(start)));
        let limiter = RateLimiter::new(
            &RateLimitConfig::default(),
            clock.clone(),
            Arc::new(DeliveryMetrics::new()),
        );
        (limiter, clock)
    }

    #[test]
    fn test_fourth_call_in_window_is_rejected() {
        let (limiter, clock) = limiter(0);
        let window = Duration::from_millis(1_000);

        for t in [0, 10, 20] {
            clock.set(UnixTimeMs(t));
            assert!(limiter.admit("route:send", window, 3).is_allowed());
        }

        clock.set(UnixTimeMs(30));
        assert_eq!(
            limiter.admit("route:send", window, 3),
            Admission::Limited {
                retry_after: Duration::from_millis(970)
            }
        );
    }

    #[test]
    fn test_window_resets_after_deadline() {
        let (limiter, clock) = limiter(0);
        let window = Duration::from_millis(100);

        assert!(limiter.admit("k", window, 1).is_allowed());
        assert!(!limiter.admit("k", window, 1).is_allowed());

        // Not reset at the deadline itself, only after it.
        clock.set(UnixTimeMs(100));
        assert!(!limiter.admit("k", window, 1).is_allowed());

        clock.set(UnixTimeMs(101));
        assert_eq!(limiter.admit("k", window, 1), Admission::Allowed { remaining: 0 });
    }

    #[test]
    fn test_keys_are_independent() {
        let (limiter, _clock) = limiter(0);
        let window = Duration::from_secs(1);

        assert!(limiter.admit("a", window, 1).is_allowed());
        assert!(!limiter.admit("a", window, 1).is_allowed());
        assert!(limiter.admit("b", window, 1).is_allowed());
    }

    #[test]
    fn test_into_result_reports_retry_after() {
        let (limiter, _clock) = limiter(0);
        let window = Duration::from_millis(500);
        limiter.admit("k", window, 1).into_result("k").unwrap();

        let err = limiter.admit("k", window, 1).into_result("k").unwrap_err();
        assert_eq!(
            err,
            DeliveryError::RateLimited {
                key: "k".into(),
                retry_after_ms: 500
            }
        );
    }

    #[test]
    fn test_sweep_bounds_memory_to_active_keys() {
        let (limiter, clock) = limiter(0);
        let window = Duration::from_millis(50);
        for i in 0..100 {
            limiter.admit(&format!("client-{i}"), window, 5);
        }
        assert_eq!(limiter.active_keys(), 100);

        clock.set(UnixTimeMs(10));
        limiter.admit("late", window, 5);
        assert_eq!(limiter.sweep_expired(UnixTimeMs(51)), 100);
        assert_eq!(limiter.active_keys(), 1);
    }

    #[test]
    fn test_opportunistic_sweep_runs_on_admit() {
        let clock = Arc::new(ManualClock::new(UnixTimeMs(0)));
        let config = RateLimitConfig {
            sweep_interval_ms: 1_000,
            ..RateLimitConfig::default()
        };
        let limiter = RateLimiter::new(&config, clock.clone(), Arc::new(DeliveryMetrics::new()));
        let window = Duration::from_millis(100);

        limiter.admit("old", window, 1);
        clock.set(UnixTimeMs(2_000));
        limiter.admit("new", window, 1);

        assert_eq!(limiter.active_keys(), 1);
    }

    #[test]
    fn test_concurrent_callers_never_exceed_max() {
        let (limiter, _clock) = limiter(0);
        let window = Duration::from_secs(60);
        let admitted = AtomicU64::new(0);

        std::thread::scope(|s| {
            for _ in 0..16 {
                s.spawn(|| {
                    for _ in 0..50 {
                        if limiter.admit("shared", window, 25).is_allowed() {
                            admitted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });

        assert_eq!(admitted.load(Ordering::Relaxed), 25);
    }

    proptest! {
        #[test]
        fn exactly_k_admissions_per_window(
            max in 1u32..20,
            window_ms in 1u64..5_000,
            offsets in proptest::collection::vec(0u64..5_000, 1..60),
        ) {
            let (limiter, clock) = limiter(0);
            let window = Duration::from_millis(window_ms);
            let mut offsets = offsets;
            offsets.sort_unstable();

            let mut allowed = 0u32;
            for offset in offsets.into_iter().filter(|o| *o <= window_ms) {
                clock.set(UnixTimeMs(offset));
                match limiter.admit("k", window, max) {
                    Admission::Allowed { .. } => allowed += 1,
                    Admission::Limited { retry_after } => {
                        prop_assert!(allowed == max);
                        prop_assert!(retry_after <= window);
                    }
                }
            }
            prop_assert!(allowed <= max);
        }
    }
}
