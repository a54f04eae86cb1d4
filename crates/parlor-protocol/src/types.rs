//! Payload types carried inside frames.

use serde::{Deserialize, Serialize};

/// A client-asserted presence identity.
///
/// Nothing verifies it and nothing makes it unique: two connections may
/// announce the same identity and both show up in the online set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// User identifier as supplied by the client.
    pub user_id: String,
    /// Human-readable name shown next to messages.
    pub display_name: String,
}

impl Identity {
    /// Create a new identity.
    #[must_use]
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }
}

/// A persisted chat message as seen by clients.
///
/// `id` and `created_at` always come from the message store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Canonical message id assigned by the store.
    pub id: String,
    /// Room the message was sent to.
    pub room_id: String,
    /// Sender user id.
    pub user_id: String,
    /// Sender display name at the time of sending.
    pub display_name: String,
    /// Message body.
    pub content: String,
    /// Canonical creation time, milliseconds since the Unix epoch.
    pub created_at: u64,
}

/// Client clock reading attached to a `send`.
///
/// Clients disagree on the encoding: some send epoch milliseconds, browsers
/// tend to send an ISO-8601 string. Neither is interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientTimestamp {
    /// Milliseconds since the Unix epoch.
    Millis(u64),
    /// Any textual form, kept verbatim.
    Text(String),
}

impl From<u64> for ClientTimestamp {
    fn from(millis: u64) -> Self {
        Self::Millis(millis)
    }
}

impl From<String> for ClientTimestamp {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for ClientTimestamp {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl std::fmt::Display for ClientTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Millis(millis) => write!(f, "{millis}"),
            Self::Text(text) => f.write_str(text),
        }
    }
}
