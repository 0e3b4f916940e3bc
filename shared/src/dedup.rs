use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::clock::UnixTimeMs;
use crate::config::{DedupConfig, KeyScope};
use crate::error::DeliveryError;
use crate::event::{EventSource, InboundEvent};
use crate::metrics::DeliveryMetrics;
use crate::model::ConversationId;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct DedupKey {
    conversation_id: ConversationId,
    prefix: String,
    /// Only set under [`KeyScope::PerSource`].
    source: Option<EventSource>,
}

#[derive(Clone, Copy, Debug)]
struct Seen {
    last_seen: UnixTimeMs,
    first_source: EventSource,
}

/// Gate that runs before any message write and drops repeated arrivals of
/// the same logical message within the dedup window.
///
/// Webhooks, socket pushes and REST re-fetches can each surface the same
/// message; only the first arrival inside the window is admitted.
///
/// Keys are retained for two windows past the latest arrival seen, so an
/// event stamped up to one window behind the newest one still finds its key.
pub struct InboundDeduplicator {
    seen: DashMap<DedupKey, Seen>,
    window: Duration,
    retention: Duration,
    /// Latest `arrived_at` observed, in ms.
    high_water_ms: AtomicU64,
    scope: KeyScope,
    metrics: Arc<DeliveryMetrics>,
}

impl InboundDeduplicator {
    pub fn new(config: &DedupConfig, metrics: Arc<DeliveryMetrics>) -> Self {
        Self {
            seen: DashMap::new(),
            window: config.window(),
            retention: config.window().saturating_mul(2),
            high_water_ms: AtomicU64::new(0),
            scope: config.key_scope,
            metrics,
        }
    }

    pub fn key_scope(&self) -> KeyScope {
        self.scope
    }

    fn key_for(&self, event: &InboundEvent) -> DedupKey {
        DedupKey {
            conversation_id: event.conversation_id,
            prefix: event.content_prefix().to_string(),
            source: match self.scope {
                KeyScope::PerSource => Some(event.source),
                KeyScope::CrossTransport => None,
            },
        }
    }

    /// `true` if an event with the same key was admitted less than one
    /// window before this one. Admitted events are recorded; duplicates are
    /// not, so the window is anchored at the first arrival.
    pub fn is_duplicate(&self, event: &InboundEvent) -> bool {
        let now = event.arrived_at;
        let latest = self.high_water_ms.fetch_max(now.0, Ordering::AcqRel).max(now.0);
        self.sweep(UnixTimeMs(latest));

        let key = self.key_for(event);
        let first_source = match self.seen.entry(key) {
            Entry::Occupied(mut occupied) => {
                let seen = *occupied.get();
                if now.abs_diff(seen.last_seen) < self.window {
                    Some(seen.first_source)
                } else {
                    occupied.insert(Seen {
                        last_seen: now,
                        first_source: event.source,
                    });
                    None
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Seen {
                    last_seen: now,
                    first_source: event.source,
                });
                None
            }
        };

        match first_source {
            Some(first_source) => {
                DeliveryMetrics::incr(&self.metrics.duplicates_suppressed);
                debug!(
                    conversation_id = %event.conversation_id,
                    source = %event.source,
                    first_source = %first_source,
                    fingerprint = %event.fingerprint(),
                    "Duplicate inbound event dropped"
                );
                true
            }
            None => false,
        }
    }

    /// [`is_duplicate`](Self::is_duplicate) as a `Result` for `?` chains.
    pub fn check(&self, event: &InboundEvent) -> Result<(), DeliveryError> {
        if self.is_duplicate(event) {
            return Err(DeliveryError::DuplicateEvent {
                conversation_id: event.conversation_id.get(),
                transport: event.source,
            });
        }
        Ok(())
    }

    /// Undo the record made when `event` was admitted, so a retry of an
    /// event whose write failed is not reported as a duplicate.
    ///
    /// A no-op if the key has since been re-recorded by another event.
    pub fn forget(&self, event: &InboundEvent) -> bool {
        let removed = self
            .seen
            .remove_if(&self.key_for(event), |_, seen| {
                seen.last_seen == event.arrived_at && seen.first_source == event.source
            })
            .is_some();
        if removed {
            debug!(
                conversation_id = %event.conversation_id,
                source = %event.source,
                "Dedup record rolled back"
            );
        }
        removed
    }

    /// Forget keys last seen two windows or more before `now`.
    pub fn sweep(&self, now: UnixTimeMs) -> usize {
        let before = self.seen.len();
        self.seen
            .retain(|_, seen| now.since(seen.last_seen) < self.retention);
        before.saturating_sub(self.seen.len())
    }

    pub fn tracked_keys(&self) -> usize {
        self.seen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn dedup(scope: KeyScope) -> InboundDeduplicator {
        let config = DedupConfig {
            window_ms: 5_000,
            key_scope: scope,
        };
        InboundDeduplicator::new(&config, Arc::new(DeliveryMetrics::new()))
    }

    fn event(conversation: i64, content: &str, source: EventSource, at: u64) -> InboundEvent {
        InboundEvent::new(
            ConversationId::new(conversation).unwrap(),
            content,
            source,
            UnixTimeMs(at),
        )
    }

    #[test]
    fn test_webhook_then_socket_within_window_is_duplicate() {
        let dedup = dedup(KeyScope::CrossTransport);
        assert!(!dedup.is_duplicate(&event(10, "Hi", EventSource::Webhook, 0)));
        assert!(dedup.is_duplicate(&event(10, "Hi", EventSource::Socket, 2_000)));
    }

    #[test]
    fn test_per_source_scope_keeps_transports_apart() {
        let dedup = dedup(KeyScope::PerSource);
        assert!(!dedup.is_duplicate(&event(10, "Hi", EventSource::Webhook, 0)));
        assert!(!dedup.is_duplicate(&event(10, "Hi", EventSource::Socket, 2_000)));
        // Same-source repeats are still suppressed.
        assert!(dedup.is_duplicate(&event(10, "Hi", EventSource::Webhook, 3_000)));
        assert!(dedup.is_duplicate(&event(10, "Hi", EventSource::Socket, 3_000)));
    }

    #[test]
    fn test_window_boundary_admits_again() {
        let dedup = dedup(KeyScope::CrossTransport);
        assert!(!dedup.is_duplicate(&event(1, "ping", EventSource::Rest, 0)));
        assert!(dedup.is_duplicate(&event(1, "ping", EventSource::Rest, 4_999)));
        assert!(!dedup.is_duplicate(&event(1, "ping", EventSource::Rest, 5_000)));
    }

    #[test]
    fn test_duplicates_do_not_extend_window() {
        let dedup = dedup(KeyScope::CrossTransport);
        assert!(!dedup.is_duplicate(&event(1, "a", EventSource::Socket, 0)));
        assert!(dedup.is_duplicate(&event(1, "a", EventSource::Socket, 4_000)));
        assert!(!dedup.is_duplicate(&event(1, "a", EventSource::Socket, 6_000)));
    }

    #[test]
    fn test_conversation_and_prefix_are_part_of_key() {
        let dedup = dedup(KeyScope::CrossTransport);
        assert!(!dedup.is_duplicate(&event(1, "hello", EventSource::Socket, 0)));
        assert!(!dedup.is_duplicate(&event(2, "hello", EventSource::Socket, 0)));
        assert!(!dedup.is_duplicate(&event(1, "hello!", EventSource::Socket, 0)));
    }

    #[test]
    fn test_only_prefix_is_compared() {
        let dedup = dedup(KeyScope::CrossTransport);
        let base = "x".repeat(50);
        assert!(!dedup.is_duplicate(&event(1, &format!("{base} tail one"), EventSource::Rest, 0)));
        assert!(dedup.is_duplicate(&event(1, &format!("{base} tail two"), EventSource::Rest, 10)));
    }

    #[test]
    fn test_out_of_order_arrival_within_window() {
        let dedup = dedup(KeyScope::CrossTransport);
        assert!(!dedup.is_duplicate(&event(1, "late", EventSource::Rest, 3_000)));
        assert!(dedup.is_duplicate(&event(1, "late", EventSource::Webhook, 1_000)));
    }

    #[test]
    fn test_sweep_bounds_index() {
        let dedup = dedup(KeyScope::CrossTransport);
        for i in 0..50 {
            dedup.is_duplicate(&event(1, &format!("m{i}"), EventSource::Socket, 0));
        }
        assert_eq!(dedup.tracked_keys(), 50);

        dedup.is_duplicate(&event(1, "fresh", EventSource::Socket, 5_000));
        assert_eq!(dedup.tracked_keys(), 51);

        dedup.is_duplicate(&event(1, "fresher", EventSource::Socket, 10_000));
        assert_eq!(dedup.tracked_keys(), 2);
    }

    #[test]
    fn test_later_unrelated_event_does_not_evict_live_key() {
        let dedup = dedup(KeyScope::CrossTransport);
        assert!(!dedup.is_duplicate(&event(1, "K", EventSource::Webhook, 0)));
        assert!(!dedup.is_duplicate(&event(1, "other", EventSource::Webhook, 5_000)));
        assert!(dedup.is_duplicate(&event(1, "K", EventSource::Socket, 2_000)));
    }

    #[test]
    fn test_forget_rolls_back_admission() {
        let dedup = dedup(KeyScope::CrossTransport);
        let first = event(2, "retry me", EventSource::Webhook, 1_000);
        assert!(!dedup.is_duplicate(&first));
        assert!(dedup.forget(&first));
        assert!(!dedup.is_duplicate(&event(2, "retry me", EventSource::Webhook, 2_000)));
    }

    #[test]
    fn test_forget_keeps_newer_record() {
        let dedup = dedup(KeyScope::CrossTransport);
        let stale = event(2, "x", EventSource::Rest, 0);
        assert!(!dedup.is_duplicate(&stale));
        assert!(!dedup.is_duplicate(&event(2, "x", EventSource::Socket, 6_000)));

        assert!(!dedup.forget(&stale));
        assert!(dedup.is_duplicate(&event(2, "x", EventSource::Webhook, 7_000)));
    }

    #[test]
    fn test_check_maps_to_error() {
        let dedup = dedup(KeyScope::CrossTransport);
        let first = event(4, "yo", EventSource::Webhook, 0);
        assert!(dedup.check(&first).is_ok());
        let err = dedup.check(&event(4, "yo", EventSource::Rest, 1)).unwrap_err();
        assert_eq!(
            err,
            DeliveryError::DuplicateEvent {
                conversation_id: 4,
                transport: EventSource::Rest
            }
        );
    }

    #[test]
    fn test_concurrent_arrivals_admit_exactly_one() {
        let dedup = dedup(KeyScope::CrossTransport);
        let admitted = AtomicUsize::new(0);
        let sources = [EventSource::Webhook, EventSource::Socket, EventSource::Rest];

        std::thread::scope(|s| {
            for (i, source) in sources.iter().cycle().take(24).enumerate() {
                let dedup = &dedup;
                let admitted = &admitted;
                s.spawn(move || {
                    let e = event(7, "same message", *source, 100 + i as u64);
                    if !dedup.is_duplicate(&e) {
                        admitted.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(admitted.load(Ordering::SeqCst), 1);
    }

    proptest! {
        #[test]
        fn exactly_one_passes_within_window(
            offsets in proptest::collection::vec(0u64..5_000, 1..40),
            per_source in any::<bool>(),
        ) {
            let scope = if per_source { KeyScope::PerSource } else { KeyScope::CrossTransport };
            let dedup = dedup(scope);
            let passed = offsets
                .iter()
                .filter(|at| !dedup.is_duplicate(&event(3, "same", EventSource::Webhook, **at)))
                .count();
            prop_assert_eq!(passed, 1);
        }
    }
}
