//! Message persistence gateway.
//!
//! The router only ever talks to a [`MessageStore`]. The store decides the
//! canonical id and timestamp of every message.

use crate::message::{now_millis, CanonicalRecord, NewMessage};
use async_trait::async_trait;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::trace;
use uuid::Uuid;

/// Persistence errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistenceError {
    /// The store could not be reached.
    #[error("Message store unavailable: {0}")]
    Unavailable(String),

    /// The store refused the write or returned bad data.
    #[error("Message store rejected the request: {0}")]
    Rejected(String),
}

/// Durable message log.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append a message and return its canonical record.
    async fn append(&self, message: NewMessage) -> Result<CanonicalRecord, PersistenceError>;

    /// All stored messages, oldest first.
    async fn list(&self) -> Result<Vec<CanonicalRecord>, PersistenceError>;

    /// Store name for logs (e.g., "memory", "sqlite").
    fn name(&self) -> &'static str;
}

/// In-process message log. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Vec<CanonicalRecord>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Check if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn append(&self, message: NewMessage) -> Result<CanonicalRecord, PersistenceError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);

        // Timestamps never go backwards within one log.
        let floor = records.last().map_or(0, |r| r.created_at);
        let created_at = now_millis().max(floor);

        let record = CanonicalRecord::from_new(Uuid::now_v7().to_string(), created_at, message);
        records.push(record.clone());

        trace!(id = %record.id, room = %record.room_id, "Message stored in memory");
        Ok(record)
    }

    async fn list(&self) -> Result<Vec<CanonicalRecord>, PersistenceError> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parlor_protocol::Identity;

    fn message(content: &str, sent_at: u64) -> NewMessage {
        NewMessage {
            room_id: "general".to_string(),
            sender: Identity::new("1", "alice"),
            content: content.to_string(),
            sent_at,
        }
    }

    #[tokio::test]
    async fn test_append_assigns_id_and_time() {
        let store = MemoryStore::new();
        let record = store.append(message("hi", 1)).await.unwrap();

        assert!(!record.id.is_empty());
        assert!(record.created_at > 1);
        assert_eq!(record.content, "hi");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_list_oldest_first() {
        let store = MemoryStore::new();
        let first = store.append(message("one", 0)).await.unwrap();
        let second = store.append(message("two", 0)).await.unwrap();

        let records = store.list().await.unwrap();
        assert_eq!(records, vec![first.clone(), second.clone()]);
        assert_ne!(first.id, second.id);
        assert!(second.created_at >= first.created_at);
    }
}
