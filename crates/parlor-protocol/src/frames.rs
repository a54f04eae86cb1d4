//! Frame types for the Parlor protocol.
//!
//! Every frame is a serde-tagged enum variant (`"type"` field), so the same
//! definitions serve both the MessagePack and the JSON encodings.

use serde::{Deserialize, Serialize};

use crate::types::{ChatMessage, ClientTimestamp, Identity};

/// Current protocol version, sent in the `connected` frame.
pub const PROTOCOL_VERSION: u8 = 1;

/// Error codes carried by [`Frame::Error`].
pub mod codes {
    /// The inbound frame could not be decoded or is not valid client input.
    pub const MALFORMED_FRAME: u16 = 4000;
    /// A submitted message failed validation.
    pub const VALIDATION: u16 = 4001;
    /// A join or leave request was rejected.
    pub const MEMBERSHIP: u16 = 4002;
    /// The connection has not announced an identity yet.
    pub const NOT_IDENTIFIED: u16 = 4003;
    /// The connection is closed.
    pub const CLOSED: u16 = 4004;
    /// The message store rejected or could not take the write.
    pub const PERSISTENCE: u16 = 5000;
}

/// Frame type identifiers, used for logging and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Announce,
    Join,
    JoinDirect,
    Leave,
    Send,
    History,
    HistoryResult,
    Presence,
    Delivered,
    Ack,
    Error,
    Ping,
    Pong,
    Connected,
}

impl FrameType {
    /// The wire tag of this frame type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameType::Announce => "announce",
            FrameType::Join => "join",
            FrameType::JoinDirect => "join_direct",
            FrameType::Leave => "leave",
            FrameType::Send => "send",
            FrameType::History => "history",
            FrameType::HistoryResult => "history_result",
            FrameType::Presence => "presence",
            FrameType::Delivered => "delivered",
            FrameType::Ack => "ack",
            FrameType::Error => "error",
            FrameType::Ping => "ping",
            FrameType::Pong => "pong",
            FrameType::Connected => "connected",
        }
    }

    /// Whether clients may send this frame type.
    #[must_use]
    pub fn is_client_frame(&self) -> bool {
        matches!(
            self,
            FrameType::Announce
                | FrameType::Join
                | FrameType::JoinDirect
                | FrameType::Leave
                | FrameType::Send
                | FrameType::History
                | FrameType::Ping
                | FrameType::Pong
        )
    }
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Attach a presence identity to this connection.
    Announce {
        /// Client-asserted user id.
        user_id: String,
        /// Client-asserted display name.
        display_name: String,
    },

    /// Join a room.
    Join {
        /// Optional request ID for acknowledgment.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        /// Room to join.
        room: String,
    },

    /// Join the direct-message room keyed by a user id.
    JoinDirect {
        /// Optional request ID for acknowledgment.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        /// User whose direct room to join.
        user_id: String,
    },

    /// Leave a room.
    Leave {
        /// Optional request ID for acknowledgment.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        /// Room to leave.
        room: String,
    },

    /// Submit a chat message to a room.
    Send {
        /// Optional request ID for acknowledgment.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        /// Target room.
        room: String,
        /// Message body.
        content: String,
        /// Sender user id as claimed by the client.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        /// Sender display name as claimed by the client.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
        /// Client clock at send time. Advisory, never forwarded.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<ClientTimestamp>,
    },

    /// Request the stored message log.
    History {
        /// Optional request ID, echoed in the result.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
    },

    /// Stored message log, oldest first.
    HistoryResult {
        /// ID of the history request, if it carried one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        /// Messages in storage order.
        messages: Vec<ChatMessage>,
    },

    /// Full online-set snapshot.
    Presence {
        /// Every announced identity, in admission order.
        users: Vec<Identity>,
    },

    /// A persisted message fanned out to room members.
    Delivered {
        /// The canonical message.
        message: ChatMessage,
    },

    /// Acknowledgment of a request.
    Ack {
        /// ID of the acknowledged request.
        id: u64,
    },

    /// Error response, sent to the requester only.
    Error {
        /// ID of the failed request, if it carried one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        /// Error code, see [`codes`].
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// Keepalive ping.
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Connection admitted.
    Connected {
        /// Unique connection identifier.
        connection_id: String,
        /// Protocol version.
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Announce { .. } => FrameType::Announce,
            Frame::Join { .. } => FrameType::Join,
            Frame::JoinDirect { .. } => FrameType::JoinDirect,
            Frame::Leave { .. } => FrameType::Leave,
            Frame::Send { .. } => FrameType::Send,
            Frame::History { .. } => FrameType::History,
            Frame::HistoryResult { .. } => FrameType::HistoryResult,
            Frame::Presence { .. } => FrameType::Presence,
            Frame::Delivered { .. } => FrameType::Delivered,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
            Frame::Connected { .. } => FrameType::Connected,
        }
    }

    /// Create a new Announce frame.
    #[must_use]
    pub fn announce(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Frame::Announce {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }

    /// Create a new Join frame.
    #[must_use]
    pub fn join(room: impl Into<String>) -> Self {
        Frame::Join {
            id: None,
            room: room.into(),
        }
    }

    /// Create a new Leave frame.
    #[must_use]
    pub fn leave(room: impl Into<String>) -> Self {
        Frame::Leave {
            id: None,
            room: room.into(),
        }
    }

    /// Create a new Send frame without a claimed identity.
    #[must_use]
    pub fn send(room: impl Into<String>, content: impl Into<String>) -> Self {
        Frame::Send {
            id: None,
            room: room.into(),
            content: content.into(),
            user_id: None,
            display_name: None,
            timestamp: None,
        }
    }

    /// Create a new Send frame with ID for acknowledgment.
    #[must_use]
    pub fn send_with_ack(id: u64, room: impl Into<String>, content: impl Into<String>) -> Self {
        Frame::Send {
            id: Some(id),
            room: room.into(),
            content: content.into(),
            user_id: None,
            display_name: None,
            timestamp: None,
        }
    }

    /// Create a new Presence frame.
    #[must_use]
    pub fn presence(users: Vec<Identity>) -> Self {
        Frame::Presence { users }
    }

    /// Create a new Delivered frame.
    #[must_use]
    pub fn delivered(message: ChatMessage) -> Self {
        Frame::Delivered { message }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack { id }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: Option<u64>, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }

    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>, heartbeat: u32) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            version: PROTOCOL_VERSION,
            heartbeat,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type() {
        let join = Frame::join("general");
        assert_eq!(join.frame_type(), FrameType::Join);
        assert!(join.frame_type().is_client_frame());

        let presence = Frame::presence(vec![]);
        assert_eq!(presence.frame_type(), FrameType::Presence);
        assert!(!presence.frame_type().is_client_frame());
    }

    #[test]
    fn test_json_tags() {
        let frame = Frame::announce("1", "alice");
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "announce");
        assert_eq!(json["user_id"], "1");

        let parsed: Frame =
            serde_json::from_str(r#"{"type":"join_direct","user_id":"42"}"#).unwrap();
        assert_eq!(
            parsed,
            Frame::JoinDirect {
                id: None,
                user_id: "42".to_string()
            }
        );
    }

    #[test]
    fn test_send_optional_fields() {
        let parsed: Frame = serde_json::from_str(
            r#"{"type":"send","room":"general","content":"hi","timestamp":17}"#,
        )
        .unwrap();

        match parsed {
            Frame::Send {
                id,
                user_id,
                timestamp,
                ..
            } => {
                assert_eq!(id, None);
                assert_eq!(user_id, None);
                assert_eq!(timestamp, Some(ClientTimestamp::Millis(17)));
            }
            other => panic!("Expected Send, got {:?}", other),
        }
    }

    #[test]
    fn test_type_tag_matches_serde() {
        let frames = vec![
            Frame::announce("1", "a"),
            Frame::join("r"),
            Frame::leave("r"),
            Frame::send("r", "x"),
            Frame::History { id: None },
            Frame::ack(1),
            Frame::error(None, codes::VALIDATION, "bad"),
            Frame::pong(None),
            Frame::connected("conn_1", 30_000),
        ];

        for frame in frames {
            let json = serde_json::to_value(&frame).unwrap();
            assert_eq!(json["type"], frame.frame_type().as_str());
        }
    }
}
