use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tokio::sync::RwLock;
use tracing::instrument;

use crate::error::DeliveryError;
use crate::model::{AuthoritativeMessage, MessageId, NewMessage};

/// Persistence collaborator.
///
/// The engine never stores messages itself; it calls this only after an
/// event passed deduplication.
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
    async fn create_message(&self, record: NewMessage) -> Result<AuthoritativeMessage, DeliveryError>;

    async fn find_message_by_provider_id(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<AuthoritativeMessage>, DeliveryError>;
}

/// Process-local store for tests and embedding without a database.
#[derive(Debug)]
pub struct InMemoryMessageStore {
    messages: RwLock<Vec<AuthoritativeMessage>>,
    by_provider_id: RwLock<HashMap<String, MessageId>>,
    next_id: AtomicI64,
    fail_writes: AtomicBool,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self {
            messages: RwLock::new(Vec::new()),
            by_provider_id: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make subsequent writes fail, for exercising error paths.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn messages(&self) -> Vec<AuthoritativeMessage> {
        self.messages.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for InMemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MessageStore for InMemoryMessageStore {
    #[instrument(skip(self, record), fields(conversation_id = %record.conversation_id))]
    async fn create_message(&self, record: NewMessage) -> Result<AuthoritativeMessage, DeliveryError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DeliveryError::Storage("injected write failure".into()));
        }

        let id = MessageId::new(self.next_id.fetch_add(1, Ordering::SeqCst))?;
        let message = AuthoritativeMessage {
            id,
            conversation_id: record.conversation_id,
            content: record.content,
            sent_at: record.sent_at,
            provider_message_id: record.provider_message_id,
        };

        // Lock order: messages, then provider index.
        let mut messages = self.messages.write().await;
        if let Some(provider_id) = &message.provider_message_id {
            self.by_provider_id
                .write()
                .await
                .insert(provider_id.clone(), id);
        }
        messages.push(message.clone());
        Ok(message)
    }

    async fn find_message_by_provider_id(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<AuthoritativeMessage>, DeliveryError> {
        let messages = self.messages.read().await;
        let Some(id) = self.by_provider_id.read().await.get(provider_message_id).copied() else {
            return Ok(None);
        };
        Ok(messages.iter().find(|m| m.id == id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::UnixTimeMs;
    use crate::model::ConversationId;

    fn record(content: &str, provider_id: Option<&str>) -> NewMessage {
        NewMessage {
            conversation_id: ConversationId::new(1).unwrap(),
            content: content.into(),
            sent_at: UnixTimeMs(10),
            provider_message_id: provider_id.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_create_assigns_increasing_ids() {
        let store = InMemoryMessageStore::new();
        let a = store.create_message(record("a", None)).await.unwrap();
        let b = store.create_message(record("b", None)).await.unwrap();
        assert_eq!(a.id.get(), 1);
        assert_eq!(b.id.get(), 2);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_find_by_provider_id() {
        let store = InMemoryMessageStore::new();
        let created = store
            .create_message(record("hi", Some("wamid.1")))
            .await
            .unwrap();

        let found = store.find_message_by_provider_id("wamid.1").await.unwrap();
        assert_eq!(found, Some(created));
        assert_eq!(store.find_message_by_provider_id("wamid.2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let store = InMemoryMessageStore::new();
        store.set_fail_writes(true);
        let err = store.create_message(record("x", None)).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Storage(_)));
        assert!(store.is_empty().await);
    }
}
