use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::clock::UnixTimeMs;
use crate::error::DeliveryError;

/// Logical thread a message belongs to (server-assigned, positive).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct ConversationId(i64);

impl ConversationId {
    pub fn new(id: i64) -> Result<Self, DeliveryError> {
        if id <= 0 {
            return Err(DeliveryError::InvalidId(format!(
                "ConversationId must be positive, got {id}"
            )));
        }
        Ok(Self(id))
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

/// Server-assigned id of a persisted message. Always positive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct MessageId(i64);

impl MessageId {
    pub fn new(id: i64) -> Result<Self, DeliveryError> {
        if id <= 0 {
            return Err(DeliveryError::InvalidId(format!(
                "MessageId must be positive, got {id}"
            )));
        }
        Ok(Self(id))
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

/// Client-side id of a message that has not been confirmed yet.
///
/// Always negative so it can never collide with a [`MessageId`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct LocalId(i64);

impl LocalId {
    pub fn new(id: i64) -> Result<Self, DeliveryError> {
        if id >= 0 {
            return Err(DeliveryError::InvalidId(format!(
                "LocalId must be negative, got {id}"
            )));
        }
        Ok(Self(id))
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

macro_rules! id_conversions {
    ($name:ident) => {
        impl TryFrom<i64> for $name {
            type Error = DeliveryError;

            fn try_from(value: i64) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> i64 {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_conversions!(ConversationId);
id_conversions!(MessageId);
id_conversions!(LocalId);

/// Hands out fresh local ids: -1, -2, -3, ...
#[derive(Debug)]
pub struct LocalIdAllocator {
    next: AtomicI64,
}

impl LocalIdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicI64::new(-1),
        }
    }

    pub fn allocate(&self) -> LocalId {
        let id = self.next.fetch_sub(1, Ordering::Relaxed);
        // i64::MIN wraps to positive; restart the sequence instead.
        if id >= 0 {
            self.next.store(-2, Ordering::Relaxed);
            return LocalId(-1);
        }
        LocalId(id)
    }
}

impl Default for LocalIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Message shown in the UI before the server confirmed it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionalMessage {
    pub local_id: LocalId,
    pub conversation_id: ConversationId,
    pub content: String,
    pub created_at: UnixTimeMs,
}

// Message bodies are customer data; keep them out of logs.
impl fmt::Debug for ProvisionalMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisionalMessage")
            .field("local_id", &self.local_id)
            .field("conversation_id", &self.conversation_id)
            .field("content_len", &self.content.len())
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Persisted record as returned by the storage collaborator.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthoritativeMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub content: String,
    pub sent_at: UnixTimeMs,
    #[serde(default)]
    pub provider_message_id: Option<String>,
}

impl fmt::Debug for AuthoritativeMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthoritativeMessage")
            .field("id", &self.id)
            .field("conversation_id", &self.conversation_id)
            .field("content_len", &self.content.len())
            .field("sent_at", &self.sent_at)
            .field("provider_message_id", &self.provider_message_id)
            .finish()
    }
}

/// Record handed to the storage collaborator for persistence.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub content: String,
    pub sent_at: UnixTimeMs,
    pub provider_message_id: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProvisionalState {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The send request itself reported failure.
    SendFailed(String),
    /// No authoritative counterpart arrived within the configured timeout.
    TimedOut,
    /// Pushed out by newer provisional messages.
    Evicted,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::SendFailed(reason) => write!(f, "send failed: {reason}"),
            FailureReason::TimedOut => f.write_str("confirmation timed out"),
            FailureReason::Evicted => f.write_str("evicted from pending set"),
        }
    }
}

/// State change of a provisional message, published to the UI.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProvisionalTransition {
    Pending {
        local_id: LocalId,
        conversation_id: ConversationId,
        at: UnixTimeMs,
    },
    Confirmed {
        local_id: LocalId,
        conversation_id: ConversationId,
        /// Replaces the provisional entry in place when known.
        message_id: Option<MessageId>,
        at: UnixTimeMs,
    },
    Failed {
        local_id: LocalId,
        conversation_id: ConversationId,
        reason: FailureReason,
        at: UnixTimeMs,
    },
}

impl ProvisionalTransition {
    pub fn local_id(&self) -> LocalId {
        match self {
            Self::Pending { local_id, .. }
            | Self::Confirmed { local_id, .. }
            | Self::Failed { local_id, .. } => *local_id,
        }
    }

    pub fn state(&self) -> ProvisionalState {
        match self {
            Self::Pending { .. } => ProvisionalState::Pending,
            Self::Confirmed { .. } => ProvisionalState::Confirmed,
            Self::Failed { .. } => ProvisionalState::Failed,
        }
    }
}
