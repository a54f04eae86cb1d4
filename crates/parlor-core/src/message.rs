//! Message types for the send path.

use parlor_protocol::{ChatMessage, ClientTimestamp, Identity};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// What a client asked to send, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Submission {
    /// Target room.
    pub room_id: String,
    /// Message body, untrimmed.
    pub content: String,
    /// User id carried by the send request, if any.
    pub claimed_user_id: Option<String>,
    /// Display name carried by the send request, if any.
    pub claimed_display_name: Option<String>,
    /// Client clock at send time. Advisory only.
    pub client_timestamp: Option<ClientTimestamp>,
}

impl Submission {
    /// Create a submission with no claimed identity.
    #[must_use]
    pub fn new(room_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            content: content.into(),
            ..Self::default()
        }
    }

    /// Set the client timestamp.
    #[must_use]
    pub fn with_client_timestamp(mut self, timestamp: impl Into<ClientTimestamp>) -> Self {
        self.client_timestamp = Some(timestamp.into());
        self
    }

    /// Set the identity claimed by the request.
    #[must_use]
    pub fn with_claimed_identity(mut self, identity: Identity) -> Self {
        self.claimed_user_id = Some(identity.user_id);
        self.claimed_display_name = Some(identity.display_name);
        self
    }
}

/// A validated message on its way to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    /// Target room.
    pub room_id: String,
    /// Sender identity, denormalized so it survives identity changes.
    pub sender: Identity,
    /// Message body as submitted.
    pub content: String,
    /// Provisional local timestamp. The store assigns the real one.
    pub sent_at: u64,
}

/// The durable, authoritative version of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalRecord {
    /// Id assigned by the store.
    pub id: String,
    /// Target room.
    pub room_id: String,
    /// Sender identity.
    pub sender: Identity,
    /// Message body.
    pub content: String,
    /// Timestamp assigned by the store, milliseconds since the Unix epoch.
    pub created_at: u64,
}

impl CanonicalRecord {
    /// Build the record for a stored message.
    #[must_use]
    pub fn from_new(id: impl Into<String>, created_at: u64, message: NewMessage) -> Self {
        Self {
            id: id.into(),
            room_id: message.room_id,
            sender: message.sender,
            content: message.content,
            created_at,
        }
    }

    /// The client-facing form of this record.
    #[must_use]
    pub fn to_chat_message(&self) -> ChatMessage {
        ChatMessage {
            id: self.id.clone(),
            room_id: self.room_id.clone(),
            user_id: self.sender.user_id.clone(),
            display_name: self.sender.display_name.clone(),
            content: self.content.clone(),
            created_at: self.created_at,
        }
    }
}

impl From<CanonicalRecord> for ChatMessage {
    fn from(record: CanonicalRecord) -> Self {
        ChatMessage {
            id: record.id,
            room_id: record.room_id,
            user_id: record.sender.user_id,
            display_name: record.sender.display_name,
            content: record.content,
            created_at: record.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_ignores_provisional_timestamp() {
        let message = NewMessage {
            room_id: "general".to_string(),
            sender: Identity::new("1", "alice"),
            content: "hi".to_string(),
            sent_at: 5,
        };

        let record = CanonicalRecord::from_new("m1", 1000, message);
        let chat = record.to_chat_message();
        assert_eq!(chat.id, "m1");
        assert_eq!(chat.created_at, 1000);
        assert_eq!(chat.display_name, "alice");
        assert_eq!(ChatMessage::from(record), chat);
    }

    #[test]
    fn test_submission_builder() {
        let submission = Submission::new("general", "hi")
            .with_client_timestamp(17_u64)
            .with_claimed_identity(Identity::new("9", "mallory"));

        assert_eq!(submission.client_timestamp, Some(ClientTimestamp::Millis(17)));

        let submission =
            Submission::new("general", "hi").with_client_timestamp("2024-01-01T00:00:00.000Z");
        assert_eq!(
            submission.client_timestamp,
            Some(ClientTimestamp::Text("2024-01-01T00:00:00.000Z".to_string()))
        );
        assert_eq!(submission.claimed_user_id.as_deref(), Some("9"));
        assert_eq!(submission.claimed_display_name.as_deref(), Some("mallory"));
    }
}
