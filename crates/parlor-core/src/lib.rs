//! # parlor-core
//!
//! Connection registry, room membership and message routing for the Parlor
//! chat relay.
//!
//! - **Registry** - Live connections, their presence identity and outbound queue
//! - **Membership** - Which connections are subscribed to which rooms
//! - **MessageStore** - Durable append/list of messages (the persistence gateway)
//! - **MessageRouter** - Validate, persist, then fan out to room members
//! - **PresenceBroadcaster** - Full online-set snapshots to every connection
//! - **Hub** - Owns all of the above; one instance per server
//! - **Session** - Per-connection state machine driven by client events
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌──────────────┐
//! │   Session   │────▶│     Hub     │────▶│ MessageStore │
//! └─────────────┘     └─────────────┘     └──────────────┘
//!                       │    │    │
//!            ┌──────────┘    │    └──────────┐
//!            ▼               ▼               ▼
//!     ┌────────────┐  ┌────────────┐  ┌────────────┐
//!     │  Registry  │  │ Membership │  │  Presence  │
//!     └────────────┘  └────────────┘  └────────────┘
//! ```

pub mod connection;
pub mod hub;
pub mod message;
pub mod presence;
pub mod room;
pub mod router;
pub mod session;
pub mod store;

pub use connection::{
    ConnectionId, ConnectionState, DeliveryError, Fanout, Outbound, Registry, RegistryError,
};
pub use hub::{Hub, HubConfig, HubStats};
pub use message::{now_millis, CanonicalRecord, NewMessage, Submission};
pub use presence::PresenceBroadcaster;
pub use room::{direct_pair, direct_room, validate_room_id, Membership, MembershipError, RoomId};
pub use router::{DeliveryReport, MessageRouter, SubmitError, ValidationError};
pub use session::{ClientEvent, Reply, Session, SessionError};
pub use store::{MemoryStore, MessageStore, PersistenceError};

pub use parlor_protocol::{ChatMessage, ClientTimestamp, Identity};
