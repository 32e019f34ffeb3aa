//! Conversation Data Model
//!
//! A conversation is an ordered list of turns. A turn is one user message
//! plus exactly one assistant response per model that was asked. Responses
//! start out empty and streaming, grow by appended fragments, and freeze
//! once they reach a terminal state; the only field that may change after
//! that is the selected-as-best flag, and at most one response per turn
//! carries it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::{ChatMessage, CompletionSummary};
use crate::messages::{ConversationId, MessageId, MessageRole, ModelId};

/// Lifecycle of an assistant response
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    /// Fragments are still arriving
    Streaming,
    /// Upstream finished normally
    Success,
    /// Upstream failed, timed out, or the turn ended without a terminal event
    Error,
}

impl ResponseStatus {
    /// Whether no further fragments will be accepted
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Streaming)
    }
}

/// Why a best-response selection was refused
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SelectionError {
    /// No response with that identifier exists
    #[error("message {0} not found")]
    NotFound(MessageId),
    /// The response has not reached a terminal state yet
    #[error("response {0} is still streaming")]
    NotFinalized(MessageId),
}

/// The prompt half of a turn
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    /// Persisted identifier
    pub id: MessageId,
    /// Literal prompt text
    pub content: String,
    /// When the prompt was accepted
    pub created_at: DateTime<Utc>,
}

impl UserMessage {
    /// Create a user message stamped now
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    /// Role of this message
    #[must_use]
    pub fn role(&self) -> MessageRole {
        MessageRole::User
    }
}

/// One model's answer within a turn
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssistantResponse {
    /// Persisted identifier
    pub id: MessageId,
    /// Model that produced this response
    pub model_id: ModelId,
    /// Display name of the model
    pub model_name: String,
    /// Accumulated text
    pub content: String,
    /// Prompt tokens reported by the provider
    pub tokens_input: Option<u32>,
    /// Completion tokens reported by the provider
    pub tokens_output: Option<u32>,
    /// Wall-clock latency of the upstream call
    pub latency_ms: Option<u64>,
    /// Failure description for error-terminal responses
    pub error: Option<String>,
    /// Whether the user picked this as the best answer of its turn
    pub is_selected: bool,
    /// Streaming or terminal
    pub status: ResponseStatus,
    /// When the response slot was created
    pub created_at: DateTime<Utc>,
}

impl AssistantResponse {
    /// Create an empty streaming response
    pub fn streaming(id: MessageId, model_id: ModelId, model_name: impl Into<String>) -> Self {
        Self {
            id,
            model_id,
            model_name: model_name.into(),
            content: String::new(),
            tokens_input: None,
            tokens_output: None,
            latency_ms: None,
            error: None,
            is_selected: false,
            status: ResponseStatus::Streaming,
            created_at: Utc::now(),
        }
    }

    /// Append a fragment. Returns false (and changes nothing) once terminal.
    pub fn append(&mut self, fragment: &str) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.content.push_str(fragment);
        true
    }

    /// Finalize as a success. Returns false if already terminal.
    pub fn finish(&mut self, summary: &CompletionSummary) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.tokens_input = summary.tokens_input;
        self.tokens_output = summary.tokens_output;
        self.latency_ms = summary.latency_ms;
        self.status = ResponseStatus::Success;
        true
    }

    /// Finalize as an error, keeping any partial content. Returns false if
    /// already terminal.
    pub fn fail(&mut self, error: impl Into<String>, latency_ms: Option<u64>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.error = Some(error.into());
        self.latency_ms = latency_ms;
        self.status = ResponseStatus::Error;
        true
    }

    /// Whether the response has reached a terminal state
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// A finished response with usable content
    #[must_use]
    pub fn is_successful(&self) -> bool {
        self.status == ResponseStatus::Success && self.error.is_none() && !self.content.is_empty()
    }
}

/// One prompt and all the responses it produced
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// The prompt
    pub user_message: UserMessage,
    /// One response per requested model, in dispatch order
    pub responses: Vec<AssistantResponse>,
}

impl Turn {
    /// Create a turn from its parts
    #[must_use]
    pub fn new(user_message: UserMessage, responses: Vec<AssistantResponse>) -> Self {
        Self {
            user_message,
            responses,
        }
    }

    /// Whether every response is terminal
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.responses.iter().all(AssistantResponse::is_terminal)
    }

    /// Look up a response by identifier
    #[must_use]
    pub fn response(&self, id: &MessageId) -> Option<&AssistantResponse> {
        self.responses.iter().find(|r| &r.id == id)
    }

    /// Look up a response by model
    #[must_use]
    pub fn response_for(&self, model_id: &ModelId) -> Option<&AssistantResponse> {
        self.responses.iter().find(|r| &r.model_id == model_id)
    }

    /// The response currently flagged as best
    #[must_use]
    pub fn selected(&self) -> Option<&AssistantResponse> {
        self.responses.iter().find(|r| r.is_selected)
    }

    /// Flag one response as best and clear the flag on its siblings.
    ///
    /// Nothing changes unless the target exists and is terminal.
    pub fn select_best(&mut self, id: &MessageId) -> Result<&AssistantResponse, SelectionError> {
        let idx = self
            .responses
            .iter()
            .position(|r| &r.id == id)
            .ok_or_else(|| SelectionError::NotFound(id.clone()))?;

        if !self.responses[idx].is_terminal() {
            return Err(SelectionError::NotFinalized(id.clone()));
        }

        for (i, response) in self.responses.iter_mut().enumerate() {
            response.is_selected = i == idx;
        }
        Ok(&self.responses[idx])
    }

    /// Pick the response that represents this turn in a model's context.
    ///
    /// Priority: the model's own successful answer, then the user's pick,
    /// then the first successful answer.
    #[must_use]
    pub fn context_response(&self, for_model: Option<&ModelId>) -> Option<&AssistantResponse> {
        let mut successful = self.responses.iter().filter(|r| r.is_successful());

        if let Some(model) = for_model {
            if let Some(own) = self
                .responses
                .iter()
                .find(|r| r.is_successful() && &r.model_id == model)
            {
                return Some(own);
            }
        }

        if let Some(best) = self
            .responses
            .iter()
            .find(|r| r.is_successful() && r.is_selected)
        {
            return Some(best);
        }

        successful.next()
    }
}

/// A titled sequence of turns
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Identity
    pub id: ConversationId,
    /// Optional title, generated from the first prompt when unset
    pub title: Option<String>,
    /// Turns in submission order
    pub turns: Vec<Turn>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last time a turn was appended or the title changed
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Create an empty conversation
    pub fn new(title: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ConversationId::new(),
            title,
            turns: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Number of stored messages (user messages plus responses)
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.turns.iter().map(|t| 1 + t.responses.len()).sum()
    }

    /// Find the turn holding a given assistant response
    pub fn turn_of_mut(&mut self, id: &MessageId) -> Option<&mut Turn> {
        self.turns.iter_mut().find(|t| t.response(id).is_some())
    }

    /// Whether any user message carries this identifier
    #[must_use]
    pub fn has_user_message(&self, id: &MessageId) -> bool {
        self.turns.iter().any(|t| &t.user_message.id == id)
    }

    /// Flatten prior turns into chat history for one model.
    ///
    /// Turns without a successful answer are skipped entirely; at most the
    /// last `max_messages` messages are kept (0 = unlimited).
    #[must_use]
    pub fn context_messages(&self, for_model: Option<&ModelId>, max_messages: usize) -> Vec<ChatMessage> {
        let mut context = Vec::with_capacity(self.turns.len() * 2);

        for turn in &self.turns {
            if let Some(answer) = turn.context_response(for_model) {
                context.push(ChatMessage::user(turn.user_message.content.clone()));
                context.push(ChatMessage::assistant(answer.content.clone()));
            }
        }

        if max_messages > 0 && context.len() > max_messages {
            context.drain(..context.len() - max_messages);
        }
        context
    }
}

/// Title generated from a prompt: the first 50 characters, plus an
/// ellipsis when the prompt was longer
#[must_use]
pub fn title_from_prompt(prompt: &str) -> String {
    const TITLE_CHARS: usize = 50;
    let mut title: String = prompt.chars().take(TITLE_CHARS).collect();
    if prompt.chars().count() > TITLE_CHARS {
        title.push_str("...");
    }
    title
}
