//! History Collaborator
//!
//! Persists finalized turns and answers the questions the dispatcher asks
//! before starting a turn (does this conversation exist, what did the
//! models say before). The orchestrator only ever talks to the
//! [`HistoryStore`] trait; [`InMemoryHistory`] is the reference store the
//! daemon runs with.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::backend::ChatMessage;
use crate::conversation::{
    title_from_prompt, AssistantResponse, Conversation, SelectionError, Turn, UserMessage,
};
use crate::messages::{ConversationId, MessageId, ModelId};

/// History store errors
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum HistoryError {
    /// No conversation with that identifier
    #[error("conversation {0} not found")]
    ConversationNotFound(ConversationId),

    /// No message with that identifier
    #[error("message {0} not found")]
    MessageNotFound(MessageId),

    /// The message is a user message; only responses can be selected
    #[error("message {0} is not an assistant response")]
    NotAssistant(MessageId),

    /// The response has not reached a terminal state
    #[error("response {0} is not finalized")]
    NotFinalized(MessageId),
}

impl From<SelectionError> for HistoryError {
    fn from(err: SelectionError) -> Self {
        match err {
            SelectionError::NotFound(id) => Self::MessageNotFound(id),
            SelectionError::NotFinalized(id) => Self::NotFinalized(id),
        }
    }
}

/// Lightweight listing entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    /// Identity
    pub id: ConversationId,
    /// Title, if any
    pub title: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update
    pub updated_at: DateTime<Utc>,
    /// User messages plus responses
    pub message_count: usize,
}

impl From<&Conversation> for ConversationSummary {
    fn from(conversation: &Conversation) -> Self {
        Self {
            id: conversation.id.clone(),
            title: conversation.title.clone(),
            created_at: conversation.created_at,
            updated_at: conversation.updated_at,
            message_count: conversation.message_count(),
        }
    }
}

/// Conversation persistence consumed by the dispatcher
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Create an empty conversation
    async fn create_conversation(&self, title: Option<String>) -> Result<Conversation, HistoryError>;

    /// Fetch a conversation with all its turns
    async fn get_conversation(&self, id: &ConversationId) -> Result<Conversation, HistoryError>;

    /// Conversations, most recently updated first
    async fn list_conversations(&self, limit: usize, offset: usize) -> Vec<ConversationSummary>;

    /// Delete a conversation. Returns false if it did not exist.
    async fn delete_conversation(&self, id: &ConversationId) -> bool;

    /// Rename a conversation
    async fn update_title(&self, id: &ConversationId, title: String) -> Result<(), HistoryError>;

    /// Persist a finalized turn
    async fn append_turn(
        &self,
        conversation_id: &ConversationId,
        user_message: UserMessage,
        responses: Vec<AssistantResponse>,
    ) -> Result<(), HistoryError>;

    /// Flag a response as best of its turn, clearing its siblings
    async fn select_best(&self, message_id: &MessageId) -> Result<AssistantResponse, HistoryError>;

    /// Prior turns flattened into one model's upstream history
    async fn context_for(
        &self,
        conversation_id: &ConversationId,
        model_id: Option<&ModelId>,
        max_messages: usize,
    ) -> Result<Vec<ChatMessage>, HistoryError>;
}

/// Process-local history store
#[derive(Debug, Default)]
pub struct InMemoryHistory {
    conversations: RwLock<HashMap<ConversationId, Conversation>>,
}

impl InMemoryHistory {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored conversations
    #[must_use]
    pub fn len(&self) -> usize {
        self.conversations.read().len()
    }

    /// Whether the store holds no conversations
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conversations.read().is_empty()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistory {
    async fn create_conversation(&self, title: Option<String>) -> Result<Conversation, HistoryError> {
        let conversation = Conversation::new(title);
        debug!(conversation_id = %conversation.id, "Conversation created");
        self.conversations
            .write()
            .insert(conversation.id.clone(), conversation.clone());
        Ok(conversation)
    }

    async fn get_conversation(&self, id: &ConversationId) -> Result<Conversation, HistoryError> {
        self.conversations
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| HistoryError::ConversationNotFound(id.clone()))
    }

    async fn list_conversations(&self, limit: usize, offset: usize) -> Vec<ConversationSummary> {
        let conversations = self.conversations.read();
        let mut summaries: Vec<ConversationSummary> =
            conversations.values().map(ConversationSummary::from).collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        summaries.into_iter().skip(offset).take(limit).collect()
    }

    async fn delete_conversation(&self, id: &ConversationId) -> bool {
        self.conversations.write().remove(id).is_some()
    }

    async fn update_title(&self, id: &ConversationId, title: String) -> Result<(), HistoryError> {
        let mut conversations = self.conversations.write();
        let conversation = conversations
            .get_mut(id)
            .ok_or_else(|| HistoryError::ConversationNotFound(id.clone()))?;
        conversation.title = Some(title);
        conversation.updated_at = Utc::now();
        Ok(())
    }

    async fn append_turn(
        &self,
        conversation_id: &ConversationId,
        user_message: UserMessage,
        responses: Vec<AssistantResponse>,
    ) -> Result<(), HistoryError> {
        if let Some(streaming) = responses.iter().find(|r| !r.is_terminal()) {
            return Err(HistoryError::NotFinalized(streaming.id.clone()));
        }

        let mut conversations = self.conversations.write();
        let conversation = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| HistoryError::ConversationNotFound(conversation_id.clone()))?;

        if conversation.title.is_none() {
            conversation.title = Some(title_from_prompt(&user_message.content));
        }
        conversation.turns.push(Turn::new(user_message, responses));
        conversation.updated_at = Utc::now();

        debug!(
            conversation_id = %conversation_id,
            turns = conversation.turns.len(),
            "Turn persisted"
        );
        Ok(())
    }

    async fn select_best(&self, message_id: &MessageId) -> Result<AssistantResponse, HistoryError> {
        let mut conversations = self.conversations.write();

        for conversation in conversations.values_mut() {
            if conversation.has_user_message(message_id) {
                return Err(HistoryError::NotAssistant(message_id.clone()));
            }
            if let Some(turn) = conversation.turn_of_mut(message_id) {
                let selected = turn.select_best(message_id)?.clone();
                return Ok(selected);
            }
        }

        Err(HistoryError::MessageNotFound(message_id.clone()))
    }

    async fn context_for(
        &self,
        conversation_id: &ConversationId,
        model_id: Option<&ModelId>,
        max_messages: usize,
    ) -> Result<Vec<ChatMessage>, HistoryError> {
        let conversations = self.conversations.read();
        let conversation = conversations
            .get(conversation_id)
            .ok_or_else(|| HistoryError::ConversationNotFound(conversation_id.clone()))?;
        Ok(conversation.context_messages(model_id, max_messages))
    }
}
