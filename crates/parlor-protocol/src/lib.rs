//! # parlor-protocol
//!
//! Wire protocol for the Parlor chat relay.
//!
//! Clients and the server exchange [`Frame`]s over a persistent WebSocket.
//! Binary messages carry length-prefixed MessagePack frames, text messages
//! carry one JSON frame each.
//!
//! ## Frame Types
//!
//! - `Announce` - Attach a presence identity to the connection
//! - `Join` / `JoinDirect` / `Leave` - Room membership
//! - `Send` - Submit a chat message to a room
//! - `Presence` / `Delivered` - Server pushes (online set, fanned-out messages)
//! - `Ack` / `Error` - Request outcomes, sent to the requester only
//!
//! ## Example
//!
//! ```rust
//! use parlor_protocol::{Frame, codec};
//!
//! let frame = Frame::send("general", "hello");
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod types;

pub use codec::{decode, encode, Encoded, ProtocolError, WireFormat};
pub use frames::{codes, Frame, FrameType, PROTOCOL_VERSION};
pub use types::{ChatMessage, ClientTimestamp, Identity};
