//! Per-connection state machine.
//!
//! A [`Session`] owns one admitted connection and applies the client's events
//! to the hub one at a time: `Open` → `Identified` → `Closed`. Because each
//! event is awaited before the next is handled, one sender's messages are
//! persisted and broadcast in the order they were submitted.
//!
//! Dropping a session that was not closed evicts it, so every way a
//! connection task can end goes through eviction.

use crate::connection::{ConnectionId, ConnectionState, Outbound, RegistryError};
use crate::hub::Hub;
use crate::message::{CanonicalRecord, Submission};
use crate::room::{MembershipError, RoomId};
use crate::router::{DeliveryReport, SubmitError, ValidationError};
use crate::store::PersistenceError;
use parlor_protocol::{codes, Identity};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// An event from the client, already decoded from its wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Attach a presence identity.
    Announce(Identity),
    /// Join a room.
    Join { room: RoomId },
    /// Join the direct room of a user.
    JoinDirect { user_id: String },
    /// Leave a room.
    Leave { room: RoomId },
    /// Send a message.
    Submit(Submission),
    /// Fetch the stored log.
    History,
    /// The transport closed, cleanly or not.
    Close,
}

/// Outcome of a handled event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Announced,
    Joined { room: RoomId, newly: bool },
    Left { room: RoomId, was_member: bool },
    Submitted(DeliveryReport),
    History(Vec<CanonicalRecord>),
    Closed,
}

/// Session errors. All of them are reported to this connection only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The session is closed; no further events are accepted.
    #[error("Connection is closed")]
    Closed,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Membership(#[from] MembershipError),

    #[error(transparent)]
    Submit(#[from] SubmitError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl SessionError {
    /// Protocol error code for this failure.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            SessionError::Closed | SessionError::Registry(_) => codes::CLOSED,
            SessionError::Membership(_) => codes::MEMBERSHIP,
            SessionError::Submit(e) => e.code(),
            SessionError::Persistence(_) => codes::PERSISTENCE,
        }
    }
}

/// One connection's view of the hub.
pub struct Session {
    id: ConnectionId,
    hub: Arc<Hub>,
    state: ConnectionState,
}

impl Session {
    /// Admit a connection and start its session.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub refuses the connection.
    pub fn open(hub: Arc<Hub>) -> Result<(Self, Outbound), RegistryError> {
        let (id, outbound) = hub.admit()?;
        let session = Self {
            id,
            hub,
            state: ConnectionState::Open,
        };
        Ok((session, outbound))
    }

    /// The connection id.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Apply one client event.
    ///
    /// # Errors
    ///
    /// Returns an error if the event is not valid in the current state or the
    /// hub rejects it. The session stays usable after any error except
    /// [`SessionError::Closed`].
    pub async fn handle(&mut self, event: ClientEvent) -> Result<Reply, SessionError> {
        if self.state == ConnectionState::Closed {
            return match event {
                ClientEvent::Close => Ok(Reply::Closed),
                _ => Err(SessionError::Closed),
            };
        }

        match event {
            ClientEvent::Announce(identity) => {
                self.hub.announce(&self.id, identity)?;
                self.transition(ConnectionState::Identified);
                Ok(Reply::Announced)
            }

            ClientEvent::Join { room } => {
                let newly = self.hub.join(&self.id, &room)?;
                Ok(Reply::Joined { room, newly })
            }

            ClientEvent::JoinDirect { user_id } => {
                let (room, newly) = self.hub.join_direct(&self.id, &user_id)?;
                Ok(Reply::Joined { room, newly })
            }

            ClientEvent::Leave { room } => {
                let was_member = self.hub.leave(&self.id, &room);
                Ok(Reply::Left { room, was_member })
            }

            ClientEvent::Submit(submission) => {
                if self.state != ConnectionState::Identified {
                    return Err(SubmitError::from(ValidationError::NotIdentified(
                        self.id.clone(),
                    ))
                    .into());
                }
                let report = self.hub.submit(&self.id, submission).await?;
                Ok(Reply::Submitted(report))
            }

            ClientEvent::History => Ok(Reply::History(self.hub.history().await?)),

            ClientEvent::Close => {
                self.close();
                Ok(Reply::Closed)
            }
        }
    }

    /// Evict the connection. Returns `false` if it was already closed.
    pub fn close(&mut self) -> bool {
        if self.state == ConnectionState::Closed {
            return false;
        }
        self.transition(ConnectionState::Closed);
        self.hub.evict(&self.id);
        true
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!(connection = %self.id, from = ?self.state, to = ?next, "Session state change");
            self.state = next;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use parlor_protocol::Frame;

    fn hub() -> Arc<Hub> {
        Arc::new(Hub::new(Arc::new(MemoryStore::new())))
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let hub = hub();
        let (mut session, _rx) = Session::open(Arc::clone(&hub)).unwrap();
        assert_eq!(session.state(), ConnectionState::Open);

        session
            .handle(ClientEvent::Announce(Identity::new("1", "alice")))
            .await
            .unwrap();
        assert_eq!(session.state(), ConnectionState::Identified);

        assert_eq!(session.handle(ClientEvent::Close).await, Ok(Reply::Closed));
        assert_eq!(session.state(), ConnectionState::Closed);
        assert_eq!(hub.registry().state_of(session.id()), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_submit_requires_identity() {
        let hub = hub();
        let (mut session, _rx) = Session::open(Arc::clone(&hub)).unwrap();

        let err = session
            .handle(ClientEvent::Submit(Submission::new("general", "hi")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::NOT_IDENTIFIED);
        assert!(hub.history().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_join_and_leave_before_identity() {
        let hub = hub();
        let (mut session, _rx) = Session::open(Arc::clone(&hub)).unwrap();

        let reply = session
            .handle(ClientEvent::Join {
                room: "random".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(
            reply,
            Reply::Joined {
                room: "random".to_string(),
                newly: true
            }
        );

        let reply = session
            .handle(ClientEvent::Leave {
                room: "random".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(
            reply,
            Reply::Left {
                room: "random".to_string(),
                was_member: true
            }
        );
        assert_eq!(session.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_events_after_close_rejected() {
        let hub = hub();
        let (mut session, _rx) = Session::open(Arc::clone(&hub)).unwrap();
        assert!(session.close());
        assert!(!session.close());

        assert_eq!(
            session
                .handle(ClientEvent::Join {
                    room: "general".to_string()
                })
                .await,
            Err(SessionError::Closed)
        );
        assert_eq!(session.handle(ClientEvent::Close).await, Ok(Reply::Closed));
    }

    #[tokio::test]
    async fn test_drop_evicts() {
        let hub = hub();
        let (watcher, mut rx) = Session::open(Arc::clone(&hub)).unwrap();
        let (mut session, _rx) = Session::open(Arc::clone(&hub)).unwrap();
        session
            .handle(ClientEvent::Announce(Identity::new("1", "alice")))
            .await
            .unwrap();
        let id = session.id().clone();

        drop(session);
        assert!(!hub.registry().contains(&id));
        assert!(hub.members_of("general").iter().all(|c| c != &id));

        // Snapshot after announce, then the one after eviction.
        let _ = rx.recv().await.unwrap();
        match &*rx.recv().await.unwrap() {
            Frame::Presence { users } => assert!(users.is_empty()),
            other => panic!("Expected Presence, got {:?}", other),
        }
        drop(watcher);
    }

    #[tokio::test]
    async fn test_per_sender_fifo() {
        let hub = hub();
        let (mut session, mut rx) = Session::open(Arc::clone(&hub)).unwrap();
        session
            .handle(ClientEvent::Announce(Identity::new("1", "alice")))
            .await
            .unwrap();
        let _ = rx.recv().await.unwrap();

        for i in 0..5 {
            session
                .handle(ClientEvent::Submit(Submission::new("general", format!("msg {i}"))))
                .await
                .unwrap();
        }

        for i in 0..5 {
            match &*rx.recv().await.unwrap() {
                Frame::Delivered { message } => assert_eq!(message.content, format!("msg {i}")),
                other => panic!("Expected Delivered, got {:?}", other),
            }
        }

        let history = hub.history().await.unwrap();
        assert_eq!(history.len(), 5);
        assert_eq!(history[4].content, "msg 4");
    }
}
