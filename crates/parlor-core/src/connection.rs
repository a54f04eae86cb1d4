//! Connection registry.
//!
//! Every live connection has one entry holding its optional presence identity
//! and the sending half of a bounded outbound queue. The socket writer owns
//! the receiving half.

use dashmap::DashMap;
use parlor_protocol::{Frame, Identity};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Default outbound queue capacity per connection.
pub const DEFAULT_OUTBOUND_QUEUE: usize = 256;

/// Default connection limit.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
///
/// Generated ids are unique for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a connection ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let n = NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{n}"))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle of a connection.
///
/// `Open` → `Identified` → `Closed`. Room joins are orthogonal to this chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Admitted, no identity yet.
    Open,
    /// Identity attached.
    Identified,
    /// Evicted. Terminal.
    Closed,
}

/// Receiving half of a connection's outbound queue.
pub type Outbound = mpsc::Receiver<Arc<Frame>>;

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The connection is not (or no longer) admitted.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// Admission refused.
    #[error("Connection limit reached ({0})")]
    LimitReached(usize),
}

/// Per-recipient delivery failure. Logged, never retried, never surfaced to
/// the sender of a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The recipient is gone or its writer has stopped.
    #[error("Connection closed: {0}")]
    Closed(ConnectionId),

    /// The recipient's outbound queue is full.
    #[error("Outbound queue full: {0}")]
    Full(ConnectionId),
}

/// Outcome of delivering one frame to many connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Fanout {
    /// Recipients whose queue accepted the frame.
    pub delivered: usize,
    /// Recipients that could not take it.
    pub failed: usize,
}

impl Fanout {
    pub(crate) fn record(&mut self, result: Result<(), DeliveryError>) {
        match result {
            Ok(()) => self.delivered += 1,
            Err(e) => {
                warn!(error = %e, "Delivery failed");
                self.failed += 1;
            }
        }
    }
}

#[derive(Debug)]
struct ConnectionEntry {
    /// Admission order, used to order the online set.
    seq: u64,
    identity: Option<Identity>,
    outbound: mpsc::Sender<Arc<Frame>>,
}

/// Registry of admitted connections.
#[derive(Debug)]
pub struct Registry {
    connections: DashMap<ConnectionId, ConnectionEntry>,
    /// Slots taken, reserved before insert and released on evict.
    occupied: AtomicUsize,
    next_seq: AtomicU64,
    queue_capacity: usize,
    max_connections: usize,
}

impl Registry {
    /// Create a registry with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_OUTBOUND_QUEUE, DEFAULT_MAX_CONNECTIONS)
    }

    /// Create a registry with a per-connection queue capacity and a
    /// connection limit.
    #[must_use]
    pub fn with_limits(queue_capacity: usize, max_connections: usize) -> Self {
        Self {
            connections: DashMap::new(),
            occupied: AtomicUsize::new(0),
            next_seq: AtomicU64::new(0),
            queue_capacity: queue_capacity.max(1),
            max_connections,
        }
    }

    /// Admit a new connection in the `Open` state.
    ///
    /// Returns its id and the receiving half of its outbound queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection limit is reached.
    pub fn admit(&self) -> Result<(ConnectionId, Outbound), RegistryError> {
        self.occupied
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |taken| {
                (taken < self.max_connections).then_some(taken + 1)
            })
            .map_err(|_| RegistryError::LimitReached(self.max_connections))?;

        let id = ConnectionId::generate();
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let entry = ConnectionEntry {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            identity: None,
            outbound: tx,
        };
        self.connections.insert(id.clone(), entry);

        debug!(connection = %id, "Connection admitted");
        Ok((id, rx))
    }

    /// Attach (or replace) the presence identity of a connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not admitted.
    pub fn attach_identity(&self, id: &ConnectionId, identity: Identity) -> Result<(), RegistryError> {
        let mut entry = self
            .connections
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownConnection(id.clone()))?;

        debug!(
            connection = %id,
            user_id = %identity.user_id,
            display_name = %identity.display_name,
            "Identity attached"
        );
        entry.identity = Some(identity);
        Ok(())
    }

    /// Remove a connection. Safe to call any number of times.
    ///
    /// Returns `true` if the connection was admitted.
    pub fn evict(&self, id: &ConnectionId) -> bool {
        let removed = self.connections.remove(id).is_some();
        if removed {
            self.occupied.fetch_sub(1, Ordering::AcqRel);
            debug!(connection = %id, "Connection evicted");
        }
        removed
    }

    /// Identity of a connection: `None` if it is not admitted, `Some(None)`
    /// if it has not announced one.
    #[must_use]
    pub fn identity_of(&self, id: &ConnectionId) -> Option<Option<Identity>> {
        self.connections.get(id).map(|e| e.identity.clone())
    }

    /// Lifecycle state of a connection. Unknown connections are `Closed`.
    #[must_use]
    pub fn state_of(&self, id: &ConnectionId) -> ConnectionState {
        match self.connections.get(id) {
            Some(entry) if entry.identity.is_some() => ConnectionState::Identified,
            Some(_) => ConnectionState::Open,
            None => ConnectionState::Closed,
        }
    }

    /// Check if a connection is admitted.
    #[must_use]
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    /// The online set: every attached identity, in admission order.
    ///
    /// Identities are not deduplicated.
    #[must_use]
    pub fn identities(&self) -> Vec<Identity> {
        let mut online: Vec<(u64, Identity)> = self
            .connections
            .iter()
            .filter_map(|e| e.identity.clone().map(|identity| (e.seq, identity)))
            .collect();
        online.sort_by_key(|(seq, _)| *seq);
        online.into_iter().map(|(_, identity)| identity).collect()
    }

    /// All admitted connection ids, in admission order.
    #[must_use]
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<(u64, ConnectionId)> = self
            .connections
            .iter()
            .map(|e| (e.seq, e.key().clone()))
            .collect();
        ids.sort_by_key(|(seq, _)| *seq);
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Queue a frame for one connection without waiting.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is gone or its queue is full.
    pub fn deliver(&self, id: &ConnectionId, frame: Arc<Frame>) -> Result<(), DeliveryError> {
        let Some(entry) = self.connections.get(id) else {
            return Err(DeliveryError::Closed(id.clone()));
        };

        entry.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full(id.clone()),
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed(id.clone()),
        })?;

        trace!(connection = %id, "Frame queued");
        Ok(())
    }

    /// Queue a frame for every admitted connection.
    pub fn broadcast(&self, frame: Arc<Frame>) -> Fanout {
        let mut fanout = Fanout::default();
        for id in self.connection_ids() {
            fanout.record(self.deliver(&id, Arc::clone(&frame)));
        }
        fanout
    }

    /// Number of admitted connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if no connection is admitted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Number of connections with an attached identity.
    #[must_use]
    pub fn identified_count(&self) -> usize {
        self.connections
            .iter()
            .filter(|e| e.identity.is_some())
            .count()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[test]
    fn test_admit_and_identify() {
        let registry = Registry::new();
        let (id, _rx) = registry.admit().unwrap();

        assert_eq!(registry.state_of(&id), ConnectionState::Open);
        assert_eq!(registry.identity_of(&id), Some(None));

        registry
            .attach_identity(&id, Identity::new("1", "alice"))
            .unwrap();
        assert_eq!(registry.state_of(&id), ConnectionState::Identified);
        assert_eq!(registry.identities(), vec![Identity::new("1", "alice")]);
    }

    #[test]
    fn test_attach_unknown_connection() {
        let registry = Registry::new();
        let ghost = ConnectionId::new("conn_ghost");

        assert_eq!(
            registry.attach_identity(&ghost, Identity::new("1", "alice")),
            Err(RegistryError::UnknownConnection(ghost.clone()))
        );
        assert_eq!(registry.identity_of(&ghost), None);
    }

    #[test]
    fn test_evict_idempotent() {
        let registry = Registry::new();
        let (id, _rx) = registry.admit().unwrap();
        registry
            .attach_identity(&id, Identity::new("1", "alice"))
            .unwrap();

        assert!(registry.evict(&id));
        assert!(!registry.evict(&id));
        assert_eq!(registry.state_of(&id), ConnectionState::Closed);
        assert!(registry.identities().is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_identities_in_admission_order() {
        let registry = Registry::new();
        let (a, _rx_a) = registry.admit().unwrap();
        let (_b, _rx_b) = registry.admit().unwrap();
        let (c, _rx_c) = registry.admit().unwrap();

        registry.attach_identity(&c, Identity::new("3", "carol")).unwrap();
        registry.attach_identity(&a, Identity::new("1", "alice")).unwrap();

        assert_eq!(
            registry.identities(),
            vec![Identity::new("1", "alice"), Identity::new("3", "carol")]
        );
        assert_eq!(registry.identified_count(), 2);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_connection_limit() {
        let registry = Registry::with_limits(4, 1);
        let _first = registry.admit().unwrap();

        assert!(matches!(
            registry.admit(),
            Err(RegistryError::LimitReached(1))
        ));
    }

    #[test]
    fn test_connection_limit_under_contention() {
        let registry = Registry::with_limits(4, 3);

        let admitted: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16).map(|_| scope.spawn(|| registry.admit())).collect();
            handles
                .into_iter()
                .filter_map(|h| h.join().unwrap().ok())
                .collect()
        });

        assert_eq!(admitted.len(), 3);
        assert_eq!(registry.len(), 3);

        // Evicting frees the slot, evicting twice does not free two.
        let (id, _rx) = &admitted[0];
        assert!(registry.evict(id));
        assert!(!registry.evict(id));
        let _replacement = registry.admit().unwrap();
        assert!(matches!(
            registry.admit(),
            Err(RegistryError::LimitReached(3))
        ));
    }

    #[tokio::test]
    async fn test_deliver() {
        let registry = Registry::new();
        let (id, mut rx) = registry.admit().unwrap();

        registry.deliver(&id, Arc::new(Frame::ack(1))).unwrap();
        let frame = rx.recv().await.unwrap();
        assert_eq!(*frame, Frame::ack(1));
    }

    #[test]
    fn test_deliver_failures() {
        let registry = Registry::with_limits(1, 10);
        let (id, rx) = registry.admit().unwrap();

        registry.deliver(&id, Arc::new(Frame::ack(1))).unwrap();
        assert_eq!(
            registry.deliver(&id, Arc::new(Frame::ack(2))),
            Err(DeliveryError::Full(id.clone()))
        );

        drop(rx);
        assert_eq!(
            registry.deliver(&id, Arc::new(Frame::ack(3))),
            Err(DeliveryError::Closed(id.clone()))
        );

        let ghost = ConnectionId::new("conn_ghost");
        assert_eq!(
            registry.deliver(&ghost, Arc::new(Frame::ack(4))),
            Err(DeliveryError::Closed(ghost.clone()))
        );
    }

    #[test]
    fn test_broadcast_counts_failures() {
        let registry = Registry::new();
        let (_a, _rx_a) = registry.admit().unwrap();
        let (_b, rx_b) = registry.admit().unwrap();
        drop(rx_b);

        let fanout = registry.broadcast(Arc::new(Frame::ack(1)));
        assert_eq!(fanout, Fanout { delivered: 1, failed: 1 });
    }
}
