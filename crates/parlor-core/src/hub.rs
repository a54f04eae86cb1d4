//! The hub: one owned service object holding all shared relay state.
//!
//! Construct one per server (or per test) and share it behind an `Arc`.

use crate::connection::{ConnectionId, Outbound, Registry, RegistryError};
use crate::connection::{DEFAULT_MAX_CONNECTIONS, DEFAULT_OUTBOUND_QUEUE};
use crate::message::{CanonicalRecord, Submission};
use crate::presence::PresenceBroadcaster;
use crate::room::{direct_room, Membership, MembershipError, RoomId};
use crate::room::DEFAULT_MAX_ROOMS_PER_CONNECTION;
use crate::router::{DeliveryReport, MessageRouter, SubmitError, DEFAULT_MAX_MESSAGE_SIZE};
use crate::store::{MessageStore, PersistenceError};
use parlor_protocol::Identity;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Maximum number of admitted connections.
    pub max_connections: usize,
    /// Outbound queue capacity per connection.
    pub outbound_queue: usize,
    /// Maximum rooms per connection.
    pub max_rooms_per_connection: usize,
    /// Maximum message body size in bytes.
    pub max_message_size: usize,
    /// Room every connection joins on admission, if any.
    pub default_room: Option<RoomId>,
    /// Skip presence snapshots identical to the previous one.
    pub dedupe_presence: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            max_rooms_per_connection: DEFAULT_MAX_ROOMS_PER_CONNECTION,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            default_room: Some("general".to_string()),
            dedupe_presence: false,
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    /// Admitted connections.
    pub connections: usize,
    /// Connections with an identity.
    pub identified: usize,
    /// Rooms with at least one member.
    pub rooms: usize,
    /// Total (connection, room) pairs.
    pub memberships: usize,
}

/// Connection registry, membership table, router and presence in one place.
pub struct Hub {
    registry: Arc<Registry>,
    membership: Arc<Membership>,
    router: MessageRouter,
    presence: PresenceBroadcaster,
    store: Arc<dyn MessageStore>,
    config: HubConfig,
}

impl Hub {
    /// Create a hub with default configuration.
    #[must_use]
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self::with_config(HubConfig::default(), store)
    }

    /// Create a hub with custom configuration.
    #[must_use]
    pub fn with_config(config: HubConfig, store: Arc<dyn MessageStore>) -> Self {
        info!(store = store.name(), "Creating hub with config: {:?}", config);

        let registry = Arc::new(Registry::with_limits(
            config.outbound_queue,
            config.max_connections,
        ));
        let membership = Arc::new(Membership::with_limit(config.max_rooms_per_connection));
        let router = MessageRouter::new(
            Arc::clone(&registry),
            Arc::clone(&membership),
            Arc::clone(&store),
            config.max_message_size,
        );
        let presence = if config.dedupe_presence {
            PresenceBroadcaster::deduplicating()
        } else {
            PresenceBroadcaster::new()
        };

        Self {
            registry,
            membership,
            router,
            presence,
            store,
            config,
        }
    }

    /// Admit a new connection, joining it to the default room if one is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection limit is reached.
    pub fn admit(&self) -> Result<(ConnectionId, Outbound), RegistryError> {
        let (id, outbound) = self.registry.admit()?;

        if let Some(room) = &self.config.default_room {
            if let Err(e) = self.membership.join(&id, room) {
                warn!(connection = %id, room = %room, error = %e, "Joining default room failed");
            }
        }

        Ok((id, outbound))
    }

    /// Attach an identity to a connection and announce the new online set.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not admitted.
    pub fn announce(&self, id: &ConnectionId, identity: Identity) -> Result<(), RegistryError> {
        self.registry.attach_identity(id, identity)?;
        self.presence.broadcast(&self.registry);
        Ok(())
    }

    /// Join a room. Returns `false` if already a member.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown, the room id is invalid
    /// or the room limit is reached.
    pub fn join(&self, id: &ConnectionId, room: &str) -> Result<bool, MembershipError> {
        if !self.registry.contains(id) {
            return Err(MembershipError::UnknownConnection(id.clone()));
        }

        let joined = self.membership.join(id, room)?;

        // Evicted while joining: undo so no ghost member remains.
        if !self.registry.contains(id) {
            self.membership.leave(id, room);
            return Err(MembershipError::UnknownConnection(id.clone()));
        }

        Ok(joined)
    }

    /// Join the direct room keyed by `user_id`. Returns the room id and
    /// whether the connection was newly added.
    ///
    /// # Errors
    ///
    /// Same as [`Hub::join`].
    pub fn join_direct(
        &self,
        id: &ConnectionId,
        user_id: &str,
    ) -> Result<(RoomId, bool), MembershipError> {
        let room = direct_room(user_id);
        let joined = self.join(id, &room)?;
        Ok((room, joined))
    }

    /// Leave a room. Returns `true` if the connection was a member.
    pub fn leave(&self, id: &ConnectionId, room: &str) -> bool {
        self.membership.leave(id, room)
    }

    /// Route a message. See [`MessageRouter::submit`].
    ///
    /// # Errors
    ///
    /// Returns a validation or persistence error; both are for the sender only.
    pub async fn submit(
        &self,
        id: &ConnectionId,
        submission: Submission,
    ) -> Result<DeliveryReport, SubmitError> {
        self.router.submit(id, submission).await
    }

    /// Remove a connection from every room, then from the registry, then
    /// announce the new online set. Safe to call repeatedly.
    ///
    /// Returns `true` if the connection was admitted.
    pub fn evict(&self, id: &ConnectionId) -> bool {
        let rooms = self.membership.leave_all(id);
        let removed = self.registry.evict(id);

        if removed {
            debug!(connection = %id, rooms = rooms.len(), "Evicted");
            self.presence.broadcast(&self.registry);
        }
        removed
    }

    /// The stored message log, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn history(&self) -> Result<Vec<CanonicalRecord>, PersistenceError> {
        self.store.list().await
    }

    /// The current online set, in admission order.
    #[must_use]
    pub fn online(&self) -> Vec<Identity> {
        self.registry.identities()
    }

    /// Current members of a room.
    #[must_use]
    pub fn members_of(&self, room: &str) -> Vec<ConnectionId> {
        self.membership.members_of(room)
    }

    /// Rooms a connection has joined.
    #[must_use]
    pub fn rooms_of(&self, id: &ConnectionId) -> Vec<RoomId> {
        self.membership.rooms_of(id)
    }

    /// The connection registry.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Hub configuration.
    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Get hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        let membership = self.membership.stats();
        HubStats {
            connections: self.registry.len(),
            identified: self.registry.identified_count(),
            rooms: membership.room_count,
            memberships: membership.total_memberships,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn hub() -> Hub {
        Hub::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_admit_joins_default_room() {
        let hub = hub();
        let (a, _rx) = hub.admit().unwrap();
        assert_eq!(hub.members_of("general"), vec![a.clone()]);

        let quiet = Hub::with_config(
            HubConfig {
                default_room: None,
                ..HubConfig::default()
            },
            Arc::new(MemoryStore::new()),
        );
        let (b, _rx) = quiet.admit().unwrap();
        assert!(quiet.rooms_of(&b).is_empty());
    }

    #[test]
    fn test_join_unknown_connection() {
        let hub = hub();
        let ghost = ConnectionId::new("conn_ghost");
        assert_eq!(
            hub.join(&ghost, "general"),
            Err(MembershipError::UnknownConnection(ghost.clone()))
        );
        assert!(hub.members_of("general").is_empty());
    }

    #[test]
    fn test_join_direct() {
        let hub = hub();
        let (a, _rx) = hub.admit().unwrap();

        let (room, joined) = hub.join_direct(&a, "42").unwrap();
        assert_eq!(room, "dm:42");
        assert!(joined);
        assert_eq!(hub.join_direct(&a, "42").unwrap(), ("dm:42".to_string(), false));
        assert_eq!(hub.members_of("dm:42"), vec![a]);
    }

    #[test]
    fn test_evict_idempotent() {
        let hub = hub();
        let (a, _rx_a) = hub.admit().unwrap();
        let (b, mut rx_b) = hub.admit().unwrap();
        hub.announce(&a, Identity::new("1", "alice")).unwrap();
        hub.join(&a, "dm:1").unwrap();

        // Drain the presence snapshot from the announce.
        assert!(rx_b.try_recv().is_ok());

        assert!(hub.evict(&a));
        assert!(!hub.evict(&a));

        assert!(hub.members_of("general").iter().all(|c| c != &a));
        assert!(hub.members_of("dm:1").is_empty());
        assert!(hub.online().is_empty());

        // Exactly one snapshot for the two evictions.
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
        assert_eq!(hub.members_of("general"), vec![b]);
    }

    #[test]
    fn test_announce_unknown_connection() {
        let hub = hub();
        let ghost = ConnectionId::new("conn_ghost");
        assert!(hub.announce(&ghost, Identity::new("1", "alice")).is_err());
    }

    #[test]
    fn test_stats() {
        let hub = hub();
        let (a, _rx_a) = hub.admit().unwrap();
        let (_b, _rx_b) = hub.admit().unwrap();
        hub.announce(&a, Identity::new("1", "alice")).unwrap();
        hub.join(&a, "random").unwrap();

        let stats = hub.stats();
        assert_eq!(stats.connections, 2);
        assert_eq!(stats.identified, 1);
        assert_eq!(stats.rooms, 2);
        assert_eq!(stats.memberships, 3);
    }

    #[tokio::test]
    async fn test_history_oldest_first() {
        let hub = hub();
        let (a, _rx) = hub.admit().unwrap();
        hub.announce(&a, Identity::new("1", "alice")).unwrap();

        hub.submit(&a, Submission::new("general", "one")).await.unwrap();
        hub.submit(&a, Submission::new("general", "two")).await.unwrap();

        let history = hub.history().await.unwrap();
        let contents: Vec<&str> = history.iter().map(|r| r.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "two"]);
    }
}
