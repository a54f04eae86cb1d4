//! Message router.
//!
//! The send path: validate, persist, then fan the canonical record out to
//! every member of the target room. Nothing is persisted for an invalid
//! submission and nothing is broadcast unless the store accepted the write.

use crate::connection::{ConnectionId, Fanout, Registry};
use crate::message::{now_millis, CanonicalRecord, NewMessage, Submission};
use crate::room::{validate_room_id, Membership};
use crate::store::{MessageStore, PersistenceError};
use parlor_protocol::{codes, Frame, Identity};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, trace, warn};

/// Default maximum message body size in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024;

/// Submission rejected before any side effect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The sender is not admitted.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// The sender has not announced an identity.
    #[error("Connection {0} has not announced an identity")]
    NotIdentified(ConnectionId),

    /// Invalid target room.
    #[error("Invalid room id: {0}")]
    InvalidRoom(&'static str),

    /// Body is empty after trimming whitespace.
    #[error("Message body is empty")]
    EmptyBody,

    /// Body exceeds the configured limit.
    #[error("Message body of {size} bytes exceeds maximum {max}")]
    BodyTooLarge { size: usize, max: usize },
}

/// Why a submission failed. Reported to the sender only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl SubmitError {
    /// Protocol error code for this failure.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            SubmitError::Validation(ValidationError::NotIdentified(_)) => codes::NOT_IDENTIFIED,
            SubmitError::Validation(_) => codes::VALIDATION,
            SubmitError::Persistence(_) => codes::PERSISTENCE,
        }
    }
}

/// Result of a successful submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    /// What the store recorded.
    pub record: CanonicalRecord,
    /// Room members whose queue accepted the message.
    pub delivered: usize,
    /// Room members that could not take it.
    pub failed: usize,
}

/// Routes submitted messages through the store to room members.
pub struct MessageRouter {
    registry: Arc<Registry>,
    membership: Arc<Membership>,
    store: Arc<dyn MessageStore>,
    max_message_size: usize,
}

impl MessageRouter {
    /// Create a router over shared state.
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        membership: Arc<Membership>,
        store: Arc<dyn MessageStore>,
        max_message_size: usize,
    ) -> Self {
        Self {
            registry,
            membership,
            store,
            max_message_size,
        }
    }

    /// Persist a message and deliver it to every member of its room.
    ///
    /// The delivered payload carries the id and timestamp returned by the
    /// store. The client timestamp is never forwarded.
    ///
    /// # Errors
    ///
    /// Returns [`SubmitError::Validation`] for bad input (no side effects) and
    /// [`SubmitError::Persistence`] if the store fails (no broadcast).
    pub async fn submit(
        &self,
        sender: &ConnectionId,
        submission: Submission,
    ) -> Result<DeliveryReport, SubmitError> {
        let message = self.validate(sender, submission)?;

        let record = match self.store.append(message).await {
            Ok(record) => record,
            Err(e) => {
                error!(connection = %sender, store = self.store.name(), error = %e, "Persisting message failed");
                return Err(e.into());
            }
        };

        let fanout = self.fan_out(&record);
        debug!(
            connection = %sender,
            room = %record.room_id,
            id = %record.id,
            delivered = fanout.delivered,
            failed = fanout.failed,
            "Message routed"
        );

        Ok(DeliveryReport {
            record,
            delivered: fanout.delivered,
            failed: fanout.failed,
        })
    }

    fn validate(
        &self,
        sender: &ConnectionId,
        submission: Submission,
    ) -> Result<NewMessage, ValidationError> {
        let attached = match self.registry.identity_of(sender) {
            None => return Err(ValidationError::UnknownConnection(sender.clone())),
            Some(None) => return Err(ValidationError::NotIdentified(sender.clone())),
            Some(Some(identity)) => identity,
        };

        validate_room_id(&submission.room_id).map_err(ValidationError::InvalidRoom)?;

        if submission.content.trim().is_empty() {
            return Err(ValidationError::EmptyBody);
        }
        if submission.content.len() > self.max_message_size {
            return Err(ValidationError::BodyTooLarge {
                size: submission.content.len(),
                max: self.max_message_size,
            });
        }

        if let Some(ts) = &submission.client_timestamp {
            trace!(connection = %sender, client_timestamp = %ts, "Ignoring client timestamp");
        }

        // The claimed identity is taken as-is; it is not checked against the
        // one announced on this connection.
        let sender_identity = Identity {
            user_id: submission.claimed_user_id.unwrap_or(attached.user_id),
            display_name: submission
                .claimed_display_name
                .unwrap_or(attached.display_name),
        };

        Ok(NewMessage {
            room_id: submission.room_id,
            sender: sender_identity,
            content: submission.content,
            sent_at: now_millis(),
        })
    }

    fn fan_out(&self, record: &CanonicalRecord) -> Fanout {
        let frame = Arc::new(Frame::delivered(record.to_chat_message()));
        let members = self.membership.members_of(&record.room_id);

        if members.is_empty() {
            warn!(room = %record.room_id, id = %record.id, "Message stored for a room with no members");
        }

        let mut fanout = Fanout::default();
        for member in &members {
            fanout.record(self.registry.deliver(member, Arc::clone(&frame)));
        }
        fanout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Store that returns fixed records and counts calls.
    struct FixedStore {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl MessageStore for FixedStore {
        async fn append(&self, message: NewMessage) -> Result<CanonicalRecord, PersistenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(PersistenceError::Unavailable("down".to_string()));
            }
            Ok(CanonicalRecord::from_new("m1", 1000, message))
        }

        async fn list(&self) -> Result<Vec<CanonicalRecord>, PersistenceError> {
            Ok(Vec::new())
        }

        fn name(&self) -> &'static str {
            "fixed"
        }
    }

    fn setup(fail: bool) -> (MessageRouter, Arc<Registry>, Arc<Membership>, Arc<FixedStore>) {
        let registry = Arc::new(Registry::new());
        let membership = Arc::new(Membership::new());
        let store = Arc::new(FixedStore {
            calls: AtomicUsize::new(0),
            fail,
        });
        let router = MessageRouter::new(
            Arc::clone(&registry),
            Arc::clone(&membership),
            store.clone(),
            DEFAULT_MAX_MESSAGE_SIZE,
        );
        (router, registry, membership, store)
    }

    #[tokio::test]
    async fn test_submit_uses_canonical_record() {
        let (router, registry, membership, _store) = setup(false);
        let (a, mut rx) = registry.admit().unwrap();
        registry.attach_identity(&a, Identity::new("1", "alice")).unwrap();
        membership.join(&a, "general").unwrap();

        let report = router
            .submit(&a, Submission::new("general", "hi").with_client_timestamp(5_u64))
            .await
            .unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 0);

        match &*rx.recv().await.unwrap() {
            Frame::Delivered { message } => {
                assert_eq!(message.id, "m1");
                assert_eq!(message.created_at, 1000);
                assert_eq!(message.content, "hi");
            }
            other => panic!("Expected Delivered, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_validation_has_no_side_effects() {
        let (router, registry, membership, store) = setup(false);
        let (a, mut rx) = registry.admit().unwrap();
        membership.join(&a, "general").unwrap();

        // Not identified yet.
        assert_eq!(
            router.submit(&a, Submission::new("general", "hi")).await,
            Err(SubmitError::Validation(ValidationError::NotIdentified(a.clone())))
        );

        registry.attach_identity(&a, Identity::new("1", "alice")).unwrap();

        assert_eq!(
            router.submit(&a, Submission::new("general", "  \n\t")).await,
            Err(SubmitError::Validation(ValidationError::EmptyBody))
        );
        assert!(matches!(
            router.submit(&a, Submission::new("", "hi")).await,
            Err(SubmitError::Validation(ValidationError::InvalidRoom(_)))
        ));

        let ghost = ConnectionId::new("conn_ghost");
        assert_eq!(
            router.submit(&ghost, Submission::new("general", "hi")).await,
            Err(SubmitError::Validation(ValidationError::UnknownConnection(ghost.clone())))
        );

        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_body_too_large() {
        let registry = Arc::new(Registry::new());
        let membership = Arc::new(Membership::new());
        let router = MessageRouter::new(
            Arc::clone(&registry),
            membership,
            Arc::new(MemoryStore::new()),
            4,
        );
        let (a, _rx) = registry.admit().unwrap();
        registry.attach_identity(&a, Identity::new("1", "alice")).unwrap();

        assert_eq!(
            router.submit(&a, Submission::new("general", "hello")).await,
            Err(SubmitError::Validation(ValidationError::BodyTooLarge { size: 5, max: 4 }))
        );
    }

    #[tokio::test]
    async fn test_persistence_failure_broadcasts_nothing() {
        let (router, registry, membership, store) = setup(true);
        let (a, mut rx_a) = registry.admit().unwrap();
        let (b, mut rx_b) = registry.admit().unwrap();
        registry.attach_identity(&a, Identity::new("1", "alice")).unwrap();
        membership.join(&a, "general").unwrap();
        membership.join(&b, "general").unwrap();

        let err = router
            .submit(&a, Submission::new("general", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::Persistence(_)));
        assert_eq!(err.code(), codes::PERSISTENCE);
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);

        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_claimed_identity_is_not_checked() {
        let (router, registry, membership, _store) = setup(false);
        let (a, _rx) = registry.admit().unwrap();
        registry.attach_identity(&a, Identity::new("1", "alice")).unwrap();
        membership.join(&a, "general").unwrap();

        let report = router
            .submit(
                &a,
                Submission::new("general", "hi").with_claimed_identity(Identity::new("2", "bob")),
            )
            .await
            .unwrap();
        assert_eq!(report.record.sender, Identity::new("2", "bob"));
    }

    #[tokio::test]
    async fn test_one_failed_recipient_does_not_block_others() {
        let (router, registry, membership, _store) = setup(false);
        let (a, mut rx_a) = registry.admit().unwrap();
        let (b, rx_b) = registry.admit().unwrap();
        let (c, mut rx_c) = registry.admit().unwrap();
        registry.attach_identity(&a, Identity::new("1", "alice")).unwrap();
        for conn in [&a, &b, &c] {
            membership.join(conn, "general").unwrap();
        }
        drop(rx_b);

        let report = router
            .submit(&a, Submission::new("general", "hi"))
            .await
            .unwrap();
        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, 1);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_c.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_sender_need_not_be_member() {
        let (router, registry, membership, _store) = setup(false);
        let (a, mut rx_a) = registry.admit().unwrap();
        let (b, mut rx_b) = registry.admit().unwrap();
        registry.attach_identity(&a, Identity::new("1", "alice")).unwrap();
        membership.join(&b, "dm:2").unwrap();

        let report = router
            .submit(&a, Submission::new("dm:2", "psst"))
            .await
            .unwrap();
        assert_eq!(report.delivered, 1);
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_a.try_recv().is_err());
    }
}
