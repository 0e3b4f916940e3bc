use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::event::EventSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    RateLimited,
    DuplicateEvent,
    ReconciliationTimeout,
    MalformedEvent,
    Validation,
    Storage,
    InvalidState,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::RateLimited => "RATE_LIMITED",
            Self::DuplicateEvent => "DUPLICATE_EVENT",
            Self::ReconciliationTimeout => "RECONCILIATION_TIMEOUT",
            Self::MalformedEvent => "MALFORMED_EVENT",
            Self::Validation => "VALIDATION_ERROR",
            Self::Storage => "STORAGE_ERROR",
            Self::InvalidState => "INVALID_STATE",
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::ReconciliationTimeout | Self::Storage
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("rate limited on {key}, retry after {retry_after_ms}ms")]
    RateLimited { key: String, retry_after_ms: u64 },

    #[error("duplicate event in conversation {conversation_id} via {transport}")]
    DuplicateEvent {
        conversation_id: i64,
        transport: EventSource,
    },

    #[error("provisional message {local_id} was not confirmed: {reason}")]
    ReconciliationTimeout { local_id: i64, reason: String },

    #[error("malformed inbound event: {0}")]
    MalformedEvent(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("no tokio runtime available")]
    NoRuntime,

    #[error("component has been shut down")]
    ShutDown,
}

impl DeliveryError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::DuplicateEvent { .. } => ErrorKind::DuplicateEvent,
            Self::ReconciliationTimeout { .. } => ErrorKind::ReconciliationTimeout,
            Self::MalformedEvent(_) => ErrorKind::MalformedEvent,
            Self::InvalidId(_) | Self::Validation(_) => ErrorKind::Validation,
            Self::Storage(_) => ErrorKind::Storage,
            Self::NoRuntime | Self::ShutDown => ErrorKind::InvalidState,
        }
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind().code()
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after_ms, .. } => {
                Some(Duration::from_millis(*retry_after_ms))
            }
            _ => None,
        }
    }

    /// Whether an operator should ever see this error.
    ///
    /// Duplicates and rate limiting are absorbed by the pipeline; only a
    /// provisional message that never confirmed reaches the UI.
    #[must_use]
    pub const fn is_user_visible(&self) -> bool {
        matches!(self, Self::ReconciliationTimeout { .. })
    }

    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self {
            Self::ReconciliationTimeout { .. } => "Message failed to send. Retry?".into(),
            Self::RateLimited { retry_after_ms, .. } => {
                let seconds = retry_after_ms.div_ceil(1000);
                format!("Too many requests. Please wait {seconds} seconds and try again.")
            }
            _ => "An unexpected error occurred. Please try again.".into(),
        }
    }
}

pub type DeliveryResult<T> = Result<T, DeliveryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        let err = DeliveryError::RateLimited {
            key: "ingest:1".into(),
            retry_after_ms: 970,
        };
        assert_eq!(err.code(), "RATE_LIMITED");
        assert_eq!(err.retry_after(), Some(Duration::from_millis(970)));
        assert!(err.is_retryable());

        let err = DeliveryError::MalformedEvent("missing content".into());
        assert_eq!(err.code(), "MALFORMED_EVENT");
        assert!(!err.is_retryable());
        assert_eq!(err.retry_after(), None);
    }

    #[test]
    fn test_only_reconciliation_timeout_is_user_visible() {
        let timeout = DeliveryError::ReconciliationTimeout {
            local_id: -3,
            reason: "send failed".into(),
        };
        assert!(timeout.is_user_visible());
        assert_eq!(timeout.user_facing_message(), "Message failed to send. Retry?");

        let dup = DeliveryError::DuplicateEvent {
            conversation_id: 10,
            transport: EventSource::Socket,
        };
        assert!(!dup.is_user_visible());
        assert!(!DeliveryError::ShutDown.is_user_visible());
    }

    #[test]
    fn test_rate_limited_message_rounds_up() {
        let err = DeliveryError::RateLimited {
            key: "k".into(),
            retry_after_ms: 970,
        };
        assert!(err.user_facing_message().contains("wait 1 seconds"));
    }
}
