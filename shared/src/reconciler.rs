use lru::LruCache;
use std::cmp::Reverse;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::clock::{duration_ms, Clock, UnixTimeMs};
use crate::config::ReconcilerConfig;
use crate::error::DeliveryError;
use crate::metrics::DeliveryMetrics;
use crate::model::{
    AuthoritativeMessage, ConversationId, FailureReason, LocalId, MessageId, ProvisionalMessage,
    ProvisionalState, ProvisionalTransition,
};

struct ReconcilerState {
    /// Oldest first.
    pending: VecDeque<ProvisionalMessage>,
    /// Final state of recently settled ids, so repeated confirms are no-ops.
    settled: LruCache<LocalId, ProvisionalState>,
    /// Server ids that already replaced a provisional entry.
    claimed: LruCache<MessageId, ProvisionalMessage>,
}

impl ReconcilerState {
    fn take(&mut self, local_id: LocalId) -> Option<ProvisionalMessage> {
        let idx = self.pending.iter().position(|p| p.local_id == local_id)?;
        self.pending.remove(idx)
    }

    fn take_by_content(&mut self, conversation_id: ConversationId, content: &str) -> Option<ProvisionalMessage> {
        let idx = self
            .pending
            .iter()
            .position(|p| p.conversation_id == conversation_id && p.content == content)?;
        self.pending.remove(idx)
    }
}

/// Pairs optimistic messages with their server-confirmed counterparts.
///
/// Every provisional message starts `Pending` and ends exactly once in
/// `Confirmed` or `Failed`. Each transition is broadcast to subscribers so the
/// UI can swap the provisional row for the authoritative one in place.
pub struct OptimisticReconciler {
    state: Mutex<ReconcilerState>,
    max_pending: usize,
    clock: Arc<dyn Clock>,
    metrics: Arc<DeliveryMetrics>,
    transitions: broadcast::Sender<ProvisionalTransition>,
}

impl OptimisticReconciler {
    pub fn new(config: &ReconcilerConfig, clock: Arc<dyn Clock>, metrics: Arc<DeliveryMetrics>) -> Self {
        let memory = NonZeroUsize::new(config.confirmed_memory).unwrap_or(NonZeroUsize::MIN);
        let (transitions, _) = broadcast::channel(config.transition_buffer.max(1));
        Self {
            state: Mutex::new(ReconcilerState {
                pending: VecDeque::with_capacity(config.max_pending),
                settled: LruCache::new(memory),
                claimed: LruCache::new(memory),
            }),
            max_pending: config.max_pending.max(1),
            clock,
            metrics,
            transitions,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ReconcilerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProvisionalTransition> {
        self.transitions.subscribe()
    }

    fn emit(&self, transition: ProvisionalTransition) {
        // No subscribers is fine: the UI may not be attached yet.
        let _ = self.transitions.send(transition);
    }

    /// Track a freshly sent message as pending.
    pub fn mark_pending(
        &self,
        conversation_id: ConversationId,
        local_id: LocalId,
        content: impl Into<String>,
    ) -> Result<ProvisionalMessage, DeliveryError> {
        let now = self.clock.now();
        let message = ProvisionalMessage {
            local_id,
            conversation_id,
            content: content.into(),
            created_at: now,
        };

        let mut state = self.lock();
        if state.pending.iter().any(|p| p.local_id == local_id) || state.settled.contains(&local_id) {
            return Err(DeliveryError::InvalidId(format!(
                "local id {local_id} is already tracked"
            )));
        }

        state.pending.push_back(message.clone());
        self.emit(ProvisionalTransition::Pending {
            local_id,
            conversation_id,
            at: now,
        });

        while state.pending.len() > self.max_pending {
            let Some(evicted) = state.pending.pop_front() else { break };
            state.settled.put(evicted.local_id, ProvisionalState::Failed);
            DeliveryMetrics::incr(&self.metrics.provisional_evicted);
            DeliveryMetrics::incr(&self.metrics.provisional_failed);
            warn!(
                local_id = %evicted.local_id,
                conversation_id = %evicted.conversation_id,
                "Pending provisional message evicted before confirmation"
            );
            self.emit(ProvisionalTransition::Failed {
                local_id: evicted.local_id,
                conversation_id: evicted.conversation_id,
                reason: FailureReason::Evicted,
                at: now,
            });
        }

        debug!(%local_id, %conversation_id, pending = state.pending.len(), "Provisional message pending");
        Ok(message)
    }

    /// Claim the oldest pending message in `conversation_id` whose content is
    /// exactly `content`. Each pending message can be claimed once.
    pub fn try_match(
        &self,
        conversation_id: ConversationId,
        content: &str,
        arrived_at: UnixTimeMs,
    ) -> Option<LocalId> {
        let mut state = self.lock();
        let matched = state.take_by_content(conversation_id, content)?;
        self.settle_confirmed(&mut state, &matched, None, arrived_at);
        Some(matched.local_id)
    }

    /// Match an authoritative message against pending entries and publish
    /// the replacement. A server id replaces at most one provisional entry.
    pub fn reconcile(&self, message: &AuthoritativeMessage) -> Option<LocalId> {
        let now = self.clock.now();
        let mut state = self.lock();
        if state.claimed.contains(&message.id) {
            debug!(message_id = %message.id, "Authoritative message already reconciled");
            return None;
        }

        let matched = state.take_by_content(message.conversation_id, &message.content)?;
        self.settle_confirmed(&mut state, &matched, Some(message.id), now);
        Some(matched.local_id)
    }

    /// Confirm by id, e.g. when the send request itself returned success.
    ///
    /// Returns `false` if the id is not pending (already confirmed, failed,
    /// evicted or unknown); nothing changes in that case.
    pub fn confirm(&self, local_id: LocalId) -> bool {
        self.confirm_with(local_id, None)
    }

    /// [`confirm`](Self::confirm) with the server id the send returned.
    pub fn confirm_as(&self, local_id: LocalId, message: &AuthoritativeMessage) -> bool {
        self.confirm_with(local_id, Some(message.id))
    }

    fn confirm_with(&self, local_id: LocalId, message_id: Option<MessageId>) -> bool {
        let now = self.clock.now();
        let mut state = self.lock();
        if let Some(matched) = state.take(local_id) {
            // A content match may have handed this server id to another entry.
            let displaced = message_id
                .and_then(|id| state.claimed.pop(&id))
                .filter(|p| p.local_id != local_id);
            self.settle_confirmed(&mut state, &matched, message_id, now);
            if let Some(displaced) = displaced {
                self.reopen(&mut state, displaced, now);
            }
            return true;
        }

        match message_id {
            Some(message_id) => self.reassign(&mut state, local_id, message_id, now),
            None => {
                debug!(%local_id, "Confirm ignored, id not pending");
                false
            }
        }
    }

    /// The send response for an already-confirmed entry names a different
    /// server id than its content match did. Swap the two pairings so each
    /// server id stays bound to exactly one local id.
    fn reassign(
        &self,
        state: &mut ReconcilerState,
        local_id: LocalId,
        message_id: MessageId,
        at: UnixTimeMs,
    ) -> bool {
        if state
            .claimed
            .peek(&message_id)
            .is_some_and(|p| p.local_id == local_id)
        {
            return false;
        }
        let held = state
            .claimed
            .iter()
            .find(|(_, p)| p.local_id == local_id)
            .map(|(id, p)| (*id, p.clone()));
        let Some((held_id, own)) = held else {
            debug!(%local_id, %message_id, "Confirm ignored, id not pending");
            return false;
        };

        state.claimed.pop(&held_id);
        let other = state.claimed.pop(&message_id);
        state.claimed.put(message_id, own.clone());
        warn!(
            %local_id,
            from = %held_id,
            to = %message_id,
            "Server id reassigned after send response"
        );
        self.emit(ProvisionalTransition::Confirmed {
            local_id,
            conversation_id: own.conversation_id,
            message_id: Some(message_id),
            at,
        });

        if let Some(other) = other {
            state.claimed.put(held_id, other.clone());
            self.emit(ProvisionalTransition::Confirmed {
                local_id: other.local_id,
                conversation_id: other.conversation_id,
                message_id: Some(held_id),
                at,
            });
        }
        true
    }

    /// Put a wrongly matched entry back into the pending set, in creation order.
    fn reopen(&self, state: &mut ReconcilerState, message: ProvisionalMessage, at: UnixTimeMs) {
        state.settled.pop(&message.local_id);
        let order = |p: &ProvisionalMessage| (p.created_at, Reverse(p.local_id));
        let idx = state
            .pending
            .iter()
            .position(|p| order(p) > order(&message))
            .unwrap_or(state.pending.len());
        warn!(
            local_id = %message.local_id,
            conversation_id = %message.conversation_id,
            "Provisional message reopened, its server id belongs to another send"
        );
        self.emit(ProvisionalTransition::Pending {
            local_id: message.local_id,
            conversation_id: message.conversation_id,
            at,
        });
        state.pending.insert(idx, message);
    }

    fn settle_confirmed(
        &self,
        state: &mut ReconcilerState,
        matched: &ProvisionalMessage,
        message_id: Option<MessageId>,
        at: UnixTimeMs,
    ) {
        state.settled.put(matched.local_id, ProvisionalState::Confirmed);
        if let Some(id) = message_id {
            state.claimed.put(id, matched.clone());
        }
        DeliveryMetrics::incr(&self.metrics.provisional_confirmed);
        debug!(
            local_id = %matched.local_id,
            conversation_id = %matched.conversation_id,
            message_id = ?message_id.map(MessageId::get),
            latency_ms = duration_ms(at.since(matched.created_at)),
            "Provisional message confirmed"
        );
        self.emit(ProvisionalTransition::Confirmed {
            local_id: matched.local_id,
            conversation_id: matched.conversation_id,
            message_id,
            at,
        });
    }

    /// Fail a pending message and return the error to surface to the sender.
    ///
    /// `None` if the id was not pending.
    pub fn mark_failed(&self, local_id: LocalId, reason: FailureReason) -> Option<DeliveryError> {
        let now = self.clock.now();
        let mut state = self.lock();
        let failed = state.take(local_id)?;
        Some(self.settle_failed(&mut state, &failed, reason, now))
    }

    fn settle_failed(
        &self,
        state: &mut ReconcilerState,
        failed: &ProvisionalMessage,
        reason: FailureReason,
        at: UnixTimeMs,
    ) -> DeliveryError {
        state.settled.put(failed.local_id, ProvisionalState::Failed);
        DeliveryMetrics::incr(&self.metrics.provisional_failed);
        warn!(
            local_id = %failed.local_id,
            conversation_id = %failed.conversation_id,
            %reason,
            "Provisional message failed"
        );
        self.emit(ProvisionalTransition::Failed {
            local_id: failed.local_id,
            conversation_id: failed.conversation_id,
            reason: reason.clone(),
            at,
        });
        DeliveryError::ReconciliationTimeout {
            local_id: failed.local_id.get(),
            reason: reason.to_string(),
        }
    }

    /// Fail every pending message created more than `timeout` before `now`.
    pub fn expire_overdue(&self, now: UnixTimeMs, timeout: Duration) -> Vec<DeliveryError> {
        let mut state = self.lock();
        let mut errors = Vec::new();
        // Pending is ordered by creation, so overdue entries are at the front.
        while state
            .pending
            .front()
            .is_some_and(|p| now.since(p.created_at) > timeout)
        {
            let Some(overdue) = state.pending.pop_front() else { break };
            errors.push(self.settle_failed(&mut state, &overdue, FailureReason::TimedOut, now));
        }
        if !errors.is_empty() {
            info!(expired = errors.len(), "Expired overdue provisional messages");
        }
        errors
    }

    /// Pending messages of one conversation in creation order.
    pub fn pending(&self, conversation_id: ConversationId) -> Vec<ProvisionalMessage> {
        self.lock()
            .pending
            .iter()
            .filter(|p| p.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Current state of a local id, if still remembered.
    pub fn state_of(&self, local_id: LocalId) -> Option<ProvisionalState> {
        let state = self.lock();
        if state.pending.iter().any(|p| p.local_id == local_id) {
            return Some(ProvisionalState::Pending);
        }
        state.settled.peek(&local_id).copied()
    }
}
