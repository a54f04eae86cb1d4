//! Presence broadcasting.
//!
//! Whenever the online set may have changed, the full set is recomputed from
//! the registry and sent to every admitted connection. Clients replace their
//! view on every snapshot; there are no deltas to reconcile.

use crate::connection::{Fanout, Registry};
use parlor_protocol::{Frame, Identity};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, trace};

/// Sends online-set snapshots to all connections.
#[derive(Debug, Default)]
pub struct PresenceBroadcaster {
    /// Last snapshot sent. Held while computing and queueing the next one so
    /// concurrent triggers reach each connection in order.
    last: Mutex<Option<Vec<Identity>>>,
    dedupe: bool,
}

impl PresenceBroadcaster {
    /// Create a broadcaster that sends every snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a broadcaster that skips a snapshot identical to the previous one.
    #[must_use]
    pub fn deduplicating() -> Self {
        Self {
            last: Mutex::new(None),
            dedupe: true,
        }
    }

    /// Recompute the online set and send it to every admitted connection.
    ///
    /// Returns `None` if the snapshot was skipped as a duplicate.
    pub fn broadcast(&self, registry: &Registry) -> Option<Fanout> {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);

        let online = registry.identities();
        if self.dedupe && last.as_ref() == Some(&online) {
            trace!(online = online.len(), "Presence unchanged, skipping broadcast");
            return None;
        }

        let frame = Arc::new(Frame::presence(online.clone()));
        let fanout = registry.broadcast(frame);
        debug!(
            online = online.len(),
            delivered = fanout.delivered,
            failed = fanout.failed,
            "Presence broadcast"
        );

        *last = Some(online);
        Some(fanout)
    }
}
