use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::clock::{Clock, UnixTimeMs};
use crate::config::QueueConfig;
use crate::error::DeliveryError;
use crate::metrics::DeliveryMetrics;
use crate::model::{ConversationId, MessageId};
use crate::sweeper::SweepHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueuedPush {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub enqueued_at: UnixTimeMs,
    pub processed: bool,
}

/// Notification handed to listeners once per message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryNotice {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub enqueued_at: UnixTimeMs,
    pub dispatched_at: UnixTimeMs,
}

struct QueueInner {
    entries: Mutex<HashMap<MessageId, QueuedPush>>,
    notices: broadcast::Sender<DeliveryNotice>,
    clock: Arc<dyn Clock>,
    metrics: Arc<DeliveryMetrics>,
    retention: Duration,
    closed: AtomicBool,
}

impl QueueInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<MessageId, QueuedPush>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, message_id: MessageId) {
        if self.closed.load(Ordering::Acquire) {
            debug!(%message_id, "Queue closed, dropping dispatch");
            return;
        }

        let now = self.clock.now();
        let notice = {
            let mut entries = self.lock();
            let Some(push) = entries.get_mut(&message_id) else {
                return;
            };
            if push.processed {
                return;
            }
            push.processed = true;
            DeliveryNotice {
                message_id,
                conversation_id: push.conversation_id,
                enqueued_at: push.enqueued_at,
                dispatched_at: now,
            }
        };

        DeliveryMetrics::incr(&self.metrics.pushes_dispatched);
        let listeners = self.notices.receiver_count();
        debug!(
            %message_id,
            conversation_id = %notice.conversation_id,
            listeners,
            "Delivery notice dispatched"
        );
        // No listeners is fine: notices are fire-and-forget.
        let _ = self.notices.send(notice);
    }

    fn sweep(&self, now: UnixTimeMs) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, push| !(push.processed && now.since(push.enqueued_at) > self.retention));
        let removed = before - entries.len();
        if removed > 0 {
            info!(removed, remaining = entries.len(), "Swept processed delivery entries");
        }
        removed
    }
}

/// Short-delay batching of push notifications.
///
/// Pushes referring to the same message that arrive within the delay (or
/// while the processed entry is retained) collapse into one notice.
pub struct DeliveryQueue {
    inner: Arc<QueueInner>,
    runtime: tokio::runtime::Handle,
    delay: Duration,
    sweeper: Mutex<Option<SweepHandle>>,
}

impl DeliveryQueue {
    /// Create the queue and start its retention sweep. Needs a tokio runtime.
    pub fn new(
        config: &QueueConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<DeliveryMetrics>,
    ) -> Result<Self, DeliveryError> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| DeliveryError::NoRuntime)?;
        let (notices, _) = broadcast::channel(config.notice_buffer);
        let inner = Arc::new(QueueInner {
            entries: Mutex::new(HashMap::new()),
            notices,
            clock,
            metrics,
            retention: config.retention(),
            closed: AtomicBool::new(false),
        });

        let sweep_inner = inner.clone();
        let sweeper = SweepHandle::spawn("delivery_queue", config.sweep_interval(), move || {
            sweep_inner.sweep(sweep_inner.clock.now());
        })?;

        Ok(Self {
            inner,
            runtime,
            delay: config.delay(),
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryNotice> {
        self.inner.notices.subscribe()
    }

    /// Schedule a notice for `message_id` after the batching delay.
    ///
    /// Returns `Ok(false)` when the message is already queued or was
    /// dispatched recently; the call is then a no-op.
    pub fn enqueue(
        &self,
        message_id: MessageId,
        conversation_id: ConversationId,
    ) -> Result<bool, DeliveryError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(DeliveryError::ShutDown);
        }

        let now = self.inner.clock.now();
        {
            let mut entries = self.inner.lock();
            if entries.contains_key(&message_id) {
                DeliveryMetrics::incr(&self.inner.metrics.pushes_collapsed);
                debug!(%message_id, "Push collapsed into pending delivery");
                return Ok(false);
            }
            entries.insert(
                message_id,
                QueuedPush {
                    message_id,
                    conversation_id,
                    enqueued_at: now,
                    processed: false,
                },
            );
        }
        DeliveryMetrics::incr(&self.inner.metrics.pushes_enqueued);

        let inner = self.inner.clone();
        let delay = self.delay;
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            inner.dispatch(message_id);
        });
        Ok(true)
    }

    /// Remove processed entries older than the retention window.
    pub fn sweep(&self, now: UnixTimeMs) -> usize {
        self.inner.sweep(now)
    }

    pub fn get(&self, message_id: MessageId) -> Option<QueuedPush> {
        self.inner.lock().get(&message_id).copied()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().values().filter(|p| !p.processed).count()
    }

    /// Stop the sweep task. Pending dispatches that fire afterwards are dropped.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sweeper) = sweeper {
            sweeper.shutdown().await;
        }
    }
}
