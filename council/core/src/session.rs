//! Session Management
//!
//! A session is the server-side state of one duplex connection: its
//! identity, the conversation currently bound to it, and the exclusive
//! "current turn" slot.
//!
//! # Turn Lease
//!
//! At most one turn may be in flight per session. The slot is taken with
//! [`TurnSlot::try_acquire`], which hands out a [`TurnLease`]; the slot is
//! free again exactly when the lease is dropped. A second acquisition while
//! the lease is alive fails immediately instead of queueing.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::messages::{ConversationId, MessageId, SessionId};

/// What the slot knows about the turn in flight
#[derive(Clone, Debug)]
struct ActiveTurn {
    conversation_id: Option<ConversationId>,
    response_ids: Vec<MessageId>,
    started_at: Instant,
}

/// Exclusive per-session slot for the turn in flight
#[derive(Clone, Debug, Default)]
pub struct TurnSlot {
    active: Arc<Mutex<Option<ActiveTurn>>>,
}

impl TurnSlot {
    /// Create a free slot
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the slot, or `None` if a turn is already in flight
    #[must_use]
    pub fn try_acquire(&self) -> Option<TurnLease> {
        let mut active = self.active.lock();
        if active.is_some() {
            return None;
        }
        *active = Some(ActiveTurn {
            conversation_id: None,
            response_ids: Vec::new(),
            started_at: Instant::now(),
        });
        Some(TurnLease {
            active: Arc::clone(&self.active),
        })
    }

    /// Whether a turn is in flight
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Whether a response of the turn in flight carries this identifier
    #[must_use]
    pub fn holds_response(&self, id: &MessageId) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|turn| turn.response_ids.contains(id))
    }

    /// Conversation of the turn in flight
    #[must_use]
    pub fn conversation(&self) -> Option<ConversationId> {
        self.active
            .lock()
            .as_ref()
            .and_then(|turn| turn.conversation_id.clone())
    }
}

/// Proof of exclusive ownership of a session's turn slot
///
/// Dropping the lease frees the slot.
#[derive(Debug)]
pub struct TurnLease {
    active: Arc<Mutex<Option<ActiveTurn>>>,
}

impl TurnLease {
    /// Record the conversation and response identifiers of this turn
    pub fn bind(&self, conversation_id: ConversationId, response_ids: Vec<MessageId>) {
        if let Some(turn) = self.active.lock().as_mut() {
            turn.conversation_id = Some(conversation_id);
            turn.response_ids = response_ids;
        }
    }

    /// Time since the lease was taken
    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        self.active.lock().as_ref().map_or(0, |turn| {
            u64::try_from(turn.started_at.elapsed().as_millis()).unwrap_or(u64::MAX)
        })
    }
}

impl Drop for TurnLease {
    fn drop(&mut self) {
        *self.active.lock() = None;
    }
}

/// Server-side state of one duplex connection
#[derive(Debug)]
pub struct Session {
    /// Unique session ID
    pub id: SessionId,
    /// When the connection was accepted
    pub created_at: DateTime<Utc>,
    turn: TurnSlot,
    conversation: Mutex<Option<ConversationId>>,
}

impl Session {
    /// Create a session with a free turn slot
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: SessionId::new(),
            created_at: Utc::now(),
            turn: TurnSlot::new(),
            conversation: Mutex::new(None),
        }
    }

    /// The session's turn slot
    #[must_use]
    pub fn turn(&self) -> &TurnSlot {
        &self.turn
    }

    /// Conversation most recently used on this session
    #[must_use]
    pub fn conversation(&self) -> Option<ConversationId> {
        self.conversation.lock().clone()
    }

    /// Bind the session to a conversation
    pub fn bind_conversation(&self, id: ConversationId) {
        *self.conversation.lock() = Some(id);
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_is_exclusive() {
        let slot = TurnSlot::new();
        let lease = slot.try_acquire().unwrap();
        assert!(slot.is_busy());
        assert!(slot.try_acquire().is_none());

        drop(lease);
        assert!(!slot.is_busy());
        assert!(slot.try_acquire().is_some());
    }

    #[test]
    fn test_lease_tracks_bound_responses() {
        let slot = TurnSlot::new();
        let lease = slot.try_acquire().unwrap();
        let response = MessageId::new();
        let conversation = ConversationId::new();
        lease.bind(conversation.clone(), vec![response.clone()]);

        assert!(slot.holds_response(&response));
        assert!(!slot.holds_response(&MessageId::new()));
        assert_eq!(slot.conversation(), Some(conversation));

        drop(lease);
        assert!(!slot.holds_response(&response));
    }

    #[test]
    fn test_cloned_slot_shares_state() {
        let session = Session::new();
        let handle = session.turn().clone();
        let _lease = session.turn().try_acquire().unwrap();
        assert!(handle.is_busy());
    }

    #[test]
    fn test_session_binds_conversation() {
        let session = Session::new();
        assert!(session.conversation().is_none());
        let id = ConversationId::new();
        session.bind_conversation(id.clone());
        assert_eq!(session.conversation(), Some(id));
        assert!(session.id.0.starts_with("session_"));
    }
}
