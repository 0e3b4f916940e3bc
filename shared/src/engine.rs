use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::BoundedCache;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::dedup::InboundDeduplicator;
use crate::delivery_queue::{DeliveryNotice, DeliveryQueue};
use crate::error::DeliveryError;
use crate::event::{EventSource, InboundEvent};
use crate::metrics::{DeliveryMetrics, MetricsSnapshot};
use crate::model::{
    AuthoritativeMessage, ConversationId, FailureReason, LocalId, LocalIdAllocator, MessageId,
    NewMessage, ProvisionalMessage, ProvisionalTransition,
};
use crate::rate_limit::RateLimiter;
use crate::reconciler::OptimisticReconciler;
use crate::store::MessageStore;
use crate::sweeper::SweepHandle;

pub const TAG_RENDERED: &str = "rendered";
pub const TAG_MEDIA: &str = "media";

/// What happened to one inbound event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    /// First arrival; persisted and queued for delivery.
    Persisted(AuthoritativeMessage),
    /// Same logical message already arrived within the dedup window.
    Duplicate,
    /// Provider id already stored by an earlier arrival.
    AlreadyPersisted(AuthoritativeMessage),
    /// Payload could not be normalized.
    Dropped(String),
}

/// Wires the components around one clock, one metrics registry and one
/// storage collaborator.
pub struct DeliveryEngine<S: MessageStore> {
    config: EngineConfig,
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    metrics: Arc<DeliveryMetrics>,
    rate_limiter: Arc<RateLimiter>,
    cache: BoundedCache,
    dedup: Arc<InboundDeduplicator>,
    reconciler: Arc<OptimisticReconciler>,
    queue: DeliveryQueue,
    local_ids: LocalIdAllocator,
    maintenance: Mutex<Option<SweepHandle>>,
}

impl<S: MessageStore> DeliveryEngine<S> {
    /// Validate the config, build every component and start the background
    /// sweeps. Must be called inside a tokio runtime.
    pub fn start(store: Arc<S>, config: EngineConfig, clock: Arc<dyn Clock>) -> Result<Self, DeliveryError> {
        config.validate()?;
        let metrics = Arc::new(DeliveryMetrics::new());

        let rate_limiter = Arc::new(RateLimiter::new(&config.rate_limit, clock.clone(), metrics.clone()));
        let cache = BoundedCache::new(&config.cache, clock.clone(), metrics.clone());
        let dedup = Arc::new(InboundDeduplicator::new(&config.dedup, metrics.clone()));
        let reconciler = Arc::new(OptimisticReconciler::new(&config.reconciler, clock.clone(), metrics.clone()));
        let queue = DeliveryQueue::new(&config.queue, clock.clone(), metrics.clone())?;

        let maintenance = {
            let rate_limiter = rate_limiter.clone();
            let dedup = dedup.clone();
            let reconciler = reconciler.clone();
            let clock = clock.clone();
            let confirm_timeout = config
                .reconciler
                .confirm_timeout_ms
                .map(std::time::Duration::from_millis);

            SweepHandle::spawn("engine_maintenance", config.rate_limit.sweep_interval(), move || {
                let now = clock.now();
                let buckets = rate_limiter.sweep_expired(now);
                let keys = dedup.sweep(now);
                let expired = confirm_timeout
                    .map(|timeout| reconciler.expire_overdue(now, timeout).len())
                    .unwrap_or(0);
                if buckets + keys + expired > 0 {
                    debug!(buckets, keys, expired, "Maintenance sweep");
                }
            })?
        };

        info!(
            dedup_window_ms = config.dedup.window_ms,
            key_scope = ?config.dedup.key_scope,
            cache_capacity = config.cache.capacity,
            max_pending = config.reconciler.max_pending,
            "Delivery engine started"
        );

        Ok(Self {
            config,
            store,
            clock,
            metrics,
            rate_limiter,
            cache,
            dedup,
            reconciler,
            queue,
            local_ids: LocalIdAllocator::new(),
            maintenance: Mutex::new(Some(maintenance)),
        })
    }

    // ------------------------------------------------------------------
    // Server side: inbound events
    // ------------------------------------------------------------------

    /// Run one inbound event through admission, dedup and persistence.
    ///
    /// A rate-limited event returns `Err(RateLimited)` so the transport can
    /// ask its sender to retry later.
    #[instrument(skip(self, event), fields(conversation_id = %event.conversation_id, source = %event.source))]
    pub async fn ingest(&self, event: InboundEvent) -> Result<IngestOutcome, DeliveryError> {
        self.rate_limiter
            .check(&format!("ingest:{}", event.conversation_id))?;

        if self.dedup.is_duplicate(&event) {
            return Ok(IngestOutcome::Duplicate);
        }

        // Nothing was stored, so the sender's retry must not look like a duplicate.
        let outcome = self.persist(&event).await.map_err(|e| {
            self.dedup.forget(&event);
            e
        })?;

        if let IngestOutcome::Persisted(message) = &outcome {
            DeliveryMetrics::incr(&self.metrics.events_admitted);
            // The write is durable at this point; a failed enqueue only loses the push.
            if let Err(e) = self.queue.enqueue(message.id, message.conversation_id) {
                warn!(message_id = %message.id, error = %e, "Persisted message not queued for delivery");
            }
            debug!(message_id = %message.id, "Inbound message persisted");
        }
        Ok(outcome)
    }

    async fn persist(&self, event: &InboundEvent) -> Result<IngestOutcome, DeliveryError> {
        if let Some(provider_id) = event.provider_message_id.as_deref() {
            if let Some(existing) = self.store.find_message_by_provider_id(provider_id).await? {
                DeliveryMetrics::incr(&self.metrics.duplicates_suppressed);
                debug!(message_id = %existing.id, "Provider message already persisted");
                return Ok(IngestOutcome::AlreadyPersisted(existing));
            }
        }

        let record = NewMessage {
            conversation_id: event.conversation_id,
            content: event.content.clone(),
            sent_at: event.arrived_at,
            provider_message_id: event.provider_message_id.clone(),
        };
        let message = self.store.create_message(record).await.map_err(|e| {
            error!(error = %e, "Failed to persist inbound message");
            e
        })?;
        Ok(IngestOutcome::Persisted(message))
    }

    /// Normalize a transport payload and ingest it. Malformed payloads are
    /// logged and dropped, never propagated.
    pub async fn ingest_payload(
        &self,
        source: EventSource,
        payload: &serde_json::Value,
    ) -> Result<IngestOutcome, DeliveryError> {
        match InboundEvent::from_payload(source, payload, self.clock.now()) {
            Ok(event) => self.ingest(event).await,
            Err(e) => {
                DeliveryMetrics::incr(&self.metrics.malformed_dropped);
                warn!(%source, error = %e, "Dropping malformed inbound event");
                Ok(IngestOutcome::Dropped(e.to_string()))
            }
        }
    }

    pub fn subscribe_deliveries(&self) -> broadcast::Receiver<DeliveryNotice> {
        self.queue.subscribe()
    }

    // ------------------------------------------------------------------
    // Client side: optimistic sends
    // ------------------------------------------------------------------

    /// Create the provisional message shown before the server confirms it.
    pub fn begin_send(
        &self,
        conversation_id: ConversationId,
        content: impl Into<String>,
    ) -> Result<ProvisionalMessage, DeliveryError> {
        self.rate_limiter.check(&format!("send:{conversation_id}"))?;
        let local_id = self.local_ids.allocate();
        self.reconciler.mark_pending(conversation_id, local_id, content)
    }

    /// Settle a provisional message from the send request's own result.
    ///
    /// A failed send returns the user-visible `ReconciliationTimeout`. Calls
    /// for ids that already settled are no-ops.
    pub fn complete_send(
        &self,
        local_id: LocalId,
        outcome: Result<AuthoritativeMessage, String>,
    ) -> Result<(), DeliveryError> {
        match outcome {
            Ok(message) => {
                self.reconciler.confirm_as(local_id, &message);
                Ok(())
            }
            Err(reason) => match self
                .reconciler
                .mark_failed(local_id, FailureReason::SendFailed(reason))
            {
                Some(err) => Err(err),
                None => Ok(()),
            },
        }
    }

    /// Feed an authoritative message seen by the client (push or fetch).
    pub fn on_message(&self, message: &AuthoritativeMessage) -> Option<LocalId> {
        self.reconciler.reconcile(message)
    }

    pub fn subscribe_transitions(&self) -> broadcast::Receiver<ProvisionalTransition> {
        self.reconciler.subscribe()
    }

    // ------------------------------------------------------------------
    // Render content
    // ------------------------------------------------------------------

    pub fn cache_rendered(&self, message_id: MessageId, html: impl Into<String>) {
        self.cache.put(format!("msg:{message_id}"), html, TAG_RENDERED);
    }

    pub fn rendered(&self, message_id: MessageId) -> Option<String> {
        self.cache.get(&format!("msg:{message_id}"))
    }

    pub fn cache_media(&self, resource_id: &str, resolved_url: impl Into<String>) {
        self.cache.put(format!("media:{resource_id}"), resolved_url, TAG_MEDIA);
    }

    pub fn media(&self, resource_id: &str) -> Option<String> {
        self.cache.get(&format!("media:{resource_id}"))
    }

    // ------------------------------------------------------------------
    // Admission and accessors
    // ------------------------------------------------------------------

    /// Gate for any network-facing route, using the configured limits.
    pub fn admit(&self, key: &str) -> Result<u32, DeliveryError> {
        self.rate_limiter.check(key)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn cache(&self) -> &BoundedCache {
        &self.cache
    }

    pub fn deduplicator(&self) -> &InboundDeduplicator {
        &self.dedup
    }

    pub fn reconciler(&self) -> &OptimisticReconciler {
        &self.reconciler
    }

    pub fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Stop background sweeps. Pending deliveries are dropped.
    pub async fn shutdown(&self) {
        let maintenance = self
            .maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = maintenance {
            handle.shutdown().await;
        }
        self.queue.shutdown().await;
        info!("Delivery engine shut down");
    }
}
