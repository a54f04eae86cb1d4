//! Room membership table.
//!
//! A room exists while at least one connection is subscribed to it. Both the
//! room → members index and the connection → rooms index sit behind a single
//! lock, so a fan-out read never sees a connection half-removed.

use crate::connection::ConnectionId;
use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tracing::debug;

/// Maximum room id length.
pub const MAX_ROOM_ID_LENGTH: usize = 256;

/// Default room limit per connection.
pub const DEFAULT_MAX_ROOMS_PER_CONNECTION: usize = 100;

/// Prefix of direct-message rooms.
pub const DIRECT_ROOM_PREFIX: &str = "dm:";

/// A room identifier.
pub type RoomId = String;

/// Validate a room id.
///
/// # Errors
///
/// Returns an error message if the room id is invalid.
pub fn validate_room_id(room: &str) -> Result<(), &'static str> {
    if room.is_empty() {
        return Err("Room id cannot be empty");
    }
    if room.len() > MAX_ROOM_ID_LENGTH {
        return Err("Room id too long");
    }
    if room.chars().any(char::is_control) {
        return Err("Room id contains control characters");
    }
    Ok(())
}

/// The direct room keyed by a single user id.
#[must_use]
pub fn direct_room(user_id: &str) -> RoomId {
    format!("{DIRECT_ROOM_PREFIX}{user_id}")
}

/// The direct room shared by two users. Argument order does not matter.
#[must_use]
pub fn direct_pair(a: &str, b: &str) -> RoomId {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    format!("{DIRECT_ROOM_PREFIX}{low}:{high}")
}

/// Membership errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MembershipError {
    /// Invalid room id.
    #[error("Invalid room id: {0}")]
    InvalidRoom(&'static str),

    /// The connection is not admitted.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// Maximum rooms per connection reached.
    #[error("Room limit reached ({0} rooms per connection)")]
    TooManyRooms(usize),
}

#[derive(Debug, Default)]
struct Tables {
    rooms: HashMap<RoomId, HashSet<ConnectionId>>,
    joined: HashMap<ConnectionId, HashSet<RoomId>>,
}

/// Membership statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MembershipStats {
    /// Number of rooms with at least one member.
    pub room_count: usize,
    /// Number of connections in at least one room.
    pub connection_count: usize,
    /// Total (connection, room) pairs.
    pub total_memberships: usize,
}

/// In-memory, process-local room membership table.
#[derive(Debug)]
pub struct Membership {
    tables: RwLock<Tables>,
    max_rooms_per_connection: usize,
}

impl Membership {
    /// Create an empty table with the default room limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_ROOMS_PER_CONNECTION)
    }

    /// Create an empty table with a room limit per connection.
    #[must_use]
    pub fn with_limit(max_rooms_per_connection: usize) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            max_rooms_per_connection,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a connection to a room.
    ///
    /// Returns `false` if it was already a member (no-op).
    ///
    /// # Errors
    ///
    /// Returns an error if the room id is invalid or the connection is
    /// already in the maximum number of rooms.
    pub fn join(&self, connection: &ConnectionId, room: &str) -> Result<bool, MembershipError> {
        validate_room_id(room).map_err(MembershipError::InvalidRoom)?;

        let mut guard = self.write();
        let tables = &mut *guard;
        let joined = tables.joined.entry(connection.clone()).or_default();

        if joined.contains(room) {
            return Ok(false);
        }
        if joined.len() >= self.max_rooms_per_connection {
            if joined.is_empty() {
                tables.joined.remove(connection);
            }
            return Err(MembershipError::TooManyRooms(self.max_rooms_per_connection));
        }

        joined.insert(room.to_string());
        let members = tables.rooms.entry(room.to_string()).or_insert_with(|| {
            debug!(room = %room, "Room created");
            HashSet::new()
        });
        members.insert(connection.clone());

        debug!(
            room = %room,
            connection = %connection,
            members = members.len(),
            "Joined room"
        );
        Ok(true)
    }

    /// Remove a connection from a room.
    ///
    /// Returns `true` if it was a member.
    pub fn leave(&self, connection: &ConnectionId, room: &str) -> bool {
        let mut guard = self.write();
        let tables = &mut *guard;

        let was_member = match tables.joined.get_mut(connection) {
            Some(joined) => {
                let removed = joined.remove(room);
                if joined.is_empty() {
                    tables.joined.remove(connection);
                }
                removed
            }
            None => false,
        };

        if was_member {
            Self::detach(tables, connection, room);
            debug!(room = %room, connection = %connection, "Left room");
        }
        was_member
    }

    /// Remove a connection from every room it joined.
    ///
    /// Returns the rooms it was removed from.
    pub fn leave_all(&self, connection: &ConnectionId) -> Vec<RoomId> {
        let mut guard = self.write();
        let tables = &mut *guard;

        let rooms: Vec<RoomId> = tables
            .joined
            .remove(connection)
            .map(|joined| joined.into_iter().collect())
            .unwrap_or_default();

        for room in &rooms {
            Self::detach(tables, connection, room);
        }

        if !rooms.is_empty() {
            debug!(connection = %connection, rooms = rooms.len(), "Left all rooms");
        }
        rooms
    }

    fn detach(tables: &mut Tables, connection: &ConnectionId, room: &str) {
        if let Some(members) = tables.rooms.get_mut(room) {
            members.remove(connection);
            if members.is_empty() {
                tables.rooms.remove(room);
                debug!(room = %room, "Room emptied");
            }
        }
    }

    /// Current members of a room. Empty for unknown rooms.
    #[must_use]
    pub fn members_of(&self, room: &str) -> Vec<ConnectionId> {
        self.read()
            .rooms
            .get(room)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Check if a connection is in a room.
    #[must_use]
    pub fn is_member(&self, connection: &ConnectionId, room: &str) -> bool {
        self.read()
            .rooms
            .get(room)
            .is_some_and(|members| members.contains(connection))
    }

    /// Rooms a connection has joined.
    #[must_use]
    pub fn rooms_of(&self, connection: &ConnectionId) -> Vec<RoomId> {
        self.read()
            .joined
            .get(connection)
            .map(|joined| joined.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Check if a room currently has members.
    #[must_use]
    pub fn room_exists(&self, room: &str) -> bool {
        self.read().rooms.contains_key(room)
    }

    /// Get membership statistics.
    #[must_use]
    pub fn stats(&self) -> MembershipStats {
        let tables = self.read();
        MembershipStats {
            room_count: tables.rooms.len(),
            connection_count: tables.joined.len(),
            total_memberships: tables.joined.values().map(HashSet::len).sum(),
        }
    }
}

impl Default for Membership {
    fn default() -> Self {
        Self::new()
    }
}
