use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::clock::UnixTimeMs;
use crate::error::DeliveryError;
use crate::model::ConversationId;

/// Number of leading characters of content compared for deduplication.
pub const DEDUP_PREFIX_CHARS: usize = 50;

/// Upper bound on inbound content accepted for normalization.
pub const MAX_CONTENT_BYTES: usize = 64 * 1024;

/// Transport an inbound event arrived through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Webhook,
    Socket,
    Rest,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Webhook => "webhook",
            EventSource::Socket => "socket",
            EventSource::Rest => "rest",
        }
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One arrival of a message-like event from a transport.
#[derive(Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub event_id: Uuid,
    pub conversation_id: ConversationId,
    pub content: String,
    pub source: EventSource,
    pub arrived_at: UnixTimeMs,
    pub provider_message_id: Option<String>,
}

impl fmt::Debug for InboundEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundEvent")
            .field("event_id", &self.event_id)
            .field("conversation_id", &self.conversation_id)
            .field("fingerprint", &self.fingerprint())
            .field("source", &self.source)
            .field("arrived_at", &self.arrived_at)
            .field("provider_message_id", &self.provider_message_id)
            .finish()
    }
}

/// Normalized shape every transport adapter produces.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct InboundPayload {
    conversation_id: i64,
    content: String,
    #[serde(default)]
    provider_message_id: Option<String>,
}

impl InboundEvent {
    pub fn new(
        conversation_id: ConversationId,
        content: impl Into<String>,
        source: EventSource,
        arrived_at: UnixTimeMs,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            conversation_id,
            content: content.into(),
            source,
            arrived_at,
            provider_message_id: None,
        }
    }

    pub fn with_provider_id(mut self, provider_message_id: impl Into<String>) -> Self {
        self.provider_message_id = Some(provider_message_id.into());
        self
    }

    /// Build an event from a transport payload.
    ///
    /// Expects `{"conversation_id": <int>, "content": <string>}` with an
    /// optional `provider_message_id`.
    pub fn from_payload(
        source: EventSource,
        payload: &serde_json::Value,
        arrived_at: UnixTimeMs,
    ) -> Result<Self, DeliveryError> {
        let parsed = InboundPayload::deserialize(payload)
            .map_err(|e| DeliveryError::MalformedEvent(format!("{source}: {e}")))?;

        let conversation_id = ConversationId::new(parsed.conversation_id)
            .map_err(|e| DeliveryError::MalformedEvent(e.to_string()))?;

        if parsed.content.trim().is_empty() {
            return Err(DeliveryError::MalformedEvent(format!(
                "{source}: empty content"
            )));
        }
        if parsed.content.len() > MAX_CONTENT_BYTES {
            return Err(DeliveryError::MalformedEvent(format!(
                "{source}: content exceeds {MAX_CONTENT_BYTES} bytes"
            )));
        }

        let mut event = Self::new(conversation_id, parsed.content, source, arrived_at);
        event.provider_message_id = parsed
            .provider_message_id
            .filter(|id| !id.trim().is_empty());
        Ok(event)
    }

    /// Leading characters of the content used by the dedup key.
    pub fn content_prefix(&self) -> &str {
        char_prefix(&self.content, DEDUP_PREFIX_CHARS)
    }

    /// Short stable digest of the content, safe to log.
    pub fn fingerprint(&self) -> String {
        content_fingerprint(&self.content)
    }
}

/// First `max_chars` characters of `s`, never splitting a code point.
pub fn char_prefix(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

pub fn content_fingerprint(content: &str) -> String {
    let hash = blake3::hash(content.as_bytes());
    hex::encode(&hash.as_bytes()[..8])
}
