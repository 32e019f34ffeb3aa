//! Turn Reconciler
//!
//! Receiver-side state machine that rebuilds per-model responses from the
//! multiplexed event stream.
//!
//! # States of a turn
//!
//! ```text
//!  begin_turn ─► Submitted ─turn_started─► Streaming ─turn_complete─► finalized
//!                    │                        │
//!                    └─ turn error ─► dropped  └─ disconnect / newer turn ─► unresolved
//! ```
//!
//! Buffers are keyed by model. Fragments append to their model's buffer,
//! terminal events freeze it, and events for a frozen buffer are ignored,
//! so replayed or late deliveries cannot duplicate a response. Models may
//! finalize in any order and may finalize without ever sending a fragment.
//!
//! Turns that lose their connection before `chat_complete` are never
//! replayed. They move to the unresolved list until [`TurnReconciler::reload`]
//! replaces local state with the persisted conversation.

use std::collections::HashMap;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::backend::CompletionSummary;
use crate::conversation::{AssistantResponse, Conversation, SelectionError, Turn, UserMessage};
use crate::messages::{ConversationId, MessageId, ModelId};
use crate::multiplexer::INCOMPLETE_ERROR;
use crate::protocol::{Completion, TurnEvent};

/// Best-response selection errors
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ReconcileError {
    /// The response is still streaming
    #[error("response {0} is still streaming")]
    NotFinalized(MessageId),

    /// No response with that identifier is known locally
    #[error("unknown message {0}")]
    UnknownMessage(MessageId),
}

impl From<SelectionError> for ReconcileError {
    fn from(err: SelectionError) -> Self {
        match err {
            SelectionError::NotFound(id) => Self::UnknownMessage(id),
            SelectionError::NotFinalized(id) => Self::NotFinalized(id),
        }
    }
}

/// Effect of applying one event
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Applied {
    /// The server accepted the pending turn
    TurnStarted(ConversationId),
    /// A fragment was appended
    Appended(ModelId),
    /// A model reached its terminal state
    Finalized(ModelId),
    /// The pending turn was finalized and moved into history
    TurnCompleted,
    /// The server refused the pending turn before starting it
    TurnRejected(String),
    /// A turn-level error that did not affect any turn
    Notice(String),
    /// Stale, duplicate or orphaned event
    Ignored,
}

/// A turn that lost its connection before completing
#[derive(Clone, Debug, PartialEq)]
pub struct UnresolvedTurn {
    /// Conversation, if the server had announced it
    pub conversation_id: Option<ConversationId>,
    /// Prompt, if the turn was submitted locally
    pub prompt: Option<String>,
    /// Buffers as they were when the turn was abandoned
    pub responses: Vec<AssistantResponse>,
}

#[derive(Debug)]
struct PendingTurn {
    prompt: Option<String>,
    conversation_id: Option<ConversationId>,
    started: bool,
    order: Vec<ModelId>,
    buffers: HashMap<ModelId, AssistantResponse>,
}

impl PendingTurn {
    fn new(prompt: Option<String>) -> Self {
        Self {
            prompt,
            conversation_id: None,
            started: false,
            order: Vec::new(),
            buffers: HashMap::new(),
        }
    }

    fn buffer(&mut self, model_id: &ModelId) -> &mut AssistantResponse {
        if !self.buffers.contains_key(model_id) {
            self.order.push(model_id.clone());
        }
        self.buffers.entry(model_id.clone()).or_insert_with(|| {
            AssistantResponse::streaming(MessageId::new(), model_id.clone(), model_id.as_str())
        })
    }

    fn responses(&self) -> Vec<AssistantResponse> {
        self.order
            .iter()
            .filter_map(|id| self.buffers.get(id))
            .cloned()
            .collect()
    }

    fn into_unresolved(self) -> UnresolvedTurn {
        let responses = self.responses();
        UnresolvedTurn {
            conversation_id: self.conversation_id,
            prompt: self.prompt,
            responses,
        }
    }
}

/// Client-side view of one conversation
#[derive(Debug, Default)]
pub struct TurnReconciler {
    conversation_id: Option<ConversationId>,
    turns: Vec<Turn>,
    pending: Option<PendingTurn>,
    unresolved: Vec<UnresolvedTurn>,
    last_error: Option<String>,
}

impl TurnReconciler {
    /// Create an empty reconciler
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Conversation currently shown
    #[must_use]
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        self.conversation_id.as_ref()
    }

    /// Finalized turns, oldest first
    #[must_use]
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Whether a turn is submitted or streaming
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Live buffers of the pending turn, in first-seen order
    #[must_use]
    pub fn pending_responses(&self) -> Vec<AssistantResponse> {
        self.pending.as_ref().map(PendingTurn::responses).unwrap_or_default()
    }

    /// Buffer of one model in the pending turn
    #[must_use]
    pub fn pending_response(&self, model_id: &ModelId) -> Option<&AssistantResponse> {
        self.pending.as_ref()?.buffers.get(model_id)
    }

    /// Turns abandoned by a disconnect
    #[must_use]
    pub fn unresolved(&self) -> &[UnresolvedTurn] {
        &self.unresolved
    }

    /// Most recent turn-level error from the server
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Record a locally submitted turn and seed a buffer per model.
    ///
    /// Any turn still pending is moved to the unresolved list.
    pub fn begin_turn(&mut self, prompt: impl Into<String>, models: &[ModelId]) {
        self.abandon_pending("new turn submitted");
        let mut pending = PendingTurn::new(Some(prompt.into()));
        for model in models {
            pending.buffer(model);
        }
        self.pending = Some(pending);
        self.last_error = None;
    }

    /// The channel dropped: the pending turn can no longer complete
    pub fn on_disconnect(&mut self) {
        self.abandon_pending("connection lost");
    }

    /// Replace local state with the persisted conversation
    pub fn reload(&mut self, conversation: Conversation) {
        if let Some(pending) = self.pending.take() {
            debug!(conversation_id = ?pending.conversation_id, "Dropping pending turn on reload");
        }
        self.unresolved
            .retain(|u| u.conversation_id.as_ref().is_some_and(|id| id != &conversation.id));
        self.conversation_id = Some(conversation.id);
        self.turns = conversation.turns;
    }

    /// Apply one inbound event
    pub fn apply(&mut self, event: impl Into<TurnEvent>) -> Applied {
        match event.into() {
            TurnEvent::TurnStarted { conversation_id } => self.on_turn_started(conversation_id),
            TurnEvent::Token { model_id, fragment } => self.on_token(model_id, &fragment),
            TurnEvent::ModelComplete { model_id, completion } => {
                self.on_terminal(model_id, None, Some(completion))
            }
            TurnEvent::ModelError {
                model_id,
                error,
                completion,
            } => self.on_terminal(model_id, Some(error), completion),
            TurnEvent::TurnComplete {
                conversation_id,
                user_message_id,
            } => self.on_turn_complete(conversation_id, user_message_id),
            TurnEvent::TurnError { message } => self.on_turn_error(message),
        }
    }

    /// Flag a finalized response as best of its turn
    ///
    /// # Errors
    ///
    /// `NotFinalized` for a buffer still streaming, `UnknownMessage` if no
    /// response carries the identifier.
    pub fn select_best(&mut self, message_id: &MessageId) -> Result<&AssistantResponse, ReconcileError> {
        // Pending buffers only become selectable once their turn completes
        let pending = self
            .pending
            .as_ref()
            .is_some_and(|p| p.buffers.values().any(|r| &r.id == message_id));
        if pending {
            return Err(ReconcileError::NotFinalized(message_id.clone()));
        }

        let turn = self
            .turns
            .iter_mut()
            .find(|t| t.response(message_id).is_some())
            .ok_or_else(|| ReconcileError::UnknownMessage(message_id.clone()))?;
        Ok(turn.select_best(message_id)?)
    }

    fn abandon_pending(&mut self, reason: &str) {
        if let Some(pending) = self.pending.take() {
            warn!(reason, conversation_id = ?pending.conversation_id, "Turn left unresolved");
            self.unresolved.push(pending.into_unresolved());
        }
    }

    fn on_turn_started(&mut self, conversation_id: ConversationId) -> Applied {
        let stale = self.pending.as_ref().is_some_and(|p| p.started);
        if stale {
            self.abandon_pending("newer turn started");
        }

        let pending = self.pending.get_or_insert_with(|| PendingTurn::new(None));
        pending.started = true;
        pending.conversation_id = Some(conversation_id.clone());

        if self.conversation_id.as_ref() != Some(&conversation_id) {
            if self.conversation_id.is_some() {
                debug!(conversation_id = %conversation_id, "Server switched conversation");
            }
            self.turns.clear();
            self.conversation_id = Some(conversation_id.clone());
        }
        Applied::TurnStarted(conversation_id)
    }

    fn on_token(&mut self, model_id: ModelId, fragment: &str) -> Applied {
        let Some(pending) = self.pending.as_mut() else {
            return Applied::Ignored;
        };
        if pending.buffer(&model_id).append(fragment) {
            Applied::Appended(model_id)
        } else {
            Applied::Ignored
        }
    }

    fn on_terminal(&mut self, model_id: ModelId, error: Option<String>, completion: Option<Completion>) -> Applied {
        let Some(pending) = self.pending.as_mut() else {
            return Applied::Ignored;
        };
        let buffer = pending.buffer(&model_id);
        if buffer.is_terminal() {
            debug!(model_id = %model_id, "Duplicate terminal event ignored");
            return Applied::Ignored;
        }

        let mut summary = CompletionSummary::default();
        if let Some(completion) = completion {
            // Server content is authoritative unless it would shrink the buffer
            if completion.content.len() >= buffer.content.len() {
                buffer.content = completion.content;
            }
            if !completion.model_name.is_empty() {
                buffer.model_name = completion.model_name;
            }
            if let Some(id) = completion.message_id {
                buffer.id = id;
            }
            summary = CompletionSummary {
                tokens_input: completion.tokens_input,
                tokens_output: completion.tokens_output,
                latency_ms: completion.latency_ms,
            };
        }

        match error {
            Some(error) => {
                buffer.fail(error, summary.latency_ms);
            }
            None => {
                buffer.finish(&summary);
            }
        }
        Applied::Finalized(model_id)
    }

    fn on_turn_complete(&mut self, conversation_id: ConversationId, user_message_id: MessageId) -> Applied {
        let Some(pending) = self.pending.take() else {
            return Applied::Ignored;
        };
        if pending
            .conversation_id
            .as_ref()
            .is_some_and(|id| id != &conversation_id)
        {
            // Completion of some other turn; keep waiting for ours
            self.pending = Some(pending);
            return Applied::Ignored;
        }

        let mut responses = pending.responses();
        for response in &mut responses {
            response.fail(INCOMPLETE_ERROR, None);
        }

        let user_message = UserMessage {
            id: user_message_id,
            content: pending.prompt.unwrap_or_default(),
            created_at: Utc::now(),
        };
        self.conversation_id = Some(conversation_id);
        self.turns.push(Turn::new(user_message, responses));
        Applied::TurnCompleted
    }

    fn on_turn_error(&mut self, message: String) -> Applied {
        self.last_error = Some(message.clone());
        match &self.pending {
            Some(pending) if !pending.started => {
                self.pending = None;
                Applied::TurnRejected(message)
            }
            _ => Applied::Notice(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ResponseStatus;
    use crate::protocol::ServerEvent;
    use pretty_assertions::assert_eq;

    fn started(conversation: &str) -> ServerEvent {
        ServerEvent::ConversationStarted {
            conversation_id: conversation.into(),
        }
    }

    fn token(model: &str, text: &str) -> ServerEvent {
        ServerEvent::Token {
            model_id: model.into(),
            token: text.into(),
        }
    }

    fn complete(model: &str, content: &str, error: Option<&str>) -> ServerEvent {
        ServerEvent::ModelComplete {
            model_id: model.into(),
            model_name: model.to_uppercase(),
            content: content.into(),
            tokens_input: Some(1),
            tokens_output: Some(2),
            latency_ms: Some(3),
            error: error.map(String::from),
            message_id: Some(MessageId::from(format!("msg-{model}").as_str())),
        }
    }

    fn chat_complete(conversation: &str) -> ServerEvent {
        ServerEvent::ChatComplete {
            conversation_id: conversation.into(),
            user_message_id: "user-1".into(),
        }
    }

    fn models(ids: &[&str]) -> Vec<ModelId> {
        ids.iter().map(|id| ModelId::from(*id)).collect()
    }

    #[test]
    fn test_interleaved_stream_reconciles() {
        let mut r = TurnReconciler::new();
        r.begin_turn("Say hi", &models(&["m1", "m2"]));
        r.apply(started("c1"));
        r.apply(token("m2", "Hel"));
        r.apply(token("m1", "Hi"));
        r.apply(token("m2", "lo"));
        r.apply(token("m1", " there"));
        // m2 finishes first
        assert_eq!(r.apply(complete("m2", "Hello", None)), Applied::Finalized("m2".into()));
        assert_eq!(r.pending_response(&"m1".into()).unwrap().status, ResponseStatus::Streaming);
        r.apply(complete("m1", "Hi there", None));
        assert_eq!(r.apply(chat_complete("c1")), Applied::TurnCompleted);

        let turn = &r.turns()[0];
        assert_eq!(turn.user_message.content, "Say hi");
        assert_eq!(turn.user_message.id.as_str(), "user-1");
        let contents: Vec<_> = turn.responses.iter().map(|r| r.content.as_str()).collect();
        assert_eq!(contents, vec!["Hi there", "Hello"]);
        assert_eq!(turn.responses[0].id.as_str(), "msg-m1");
        assert!(!r.is_pending());
    }

    #[test]
    fn test_error_without_tokens_and_partial_content_kept() {
        let mut r = TurnReconciler::new();
        r.begin_turn("q", &models(&["m1", "m2"]));
        r.apply(started("c1"));
        r.apply(ServerEvent::Error {
            message: "boom".into(),
            model_id: Some("m1".into()),
        });
        r.apply(token("m2", "partial"));
        r.apply(complete("m2", "", Some("timeout")));
        r.apply(chat_complete("c1"));

        let turn = &r.turns()[0];
        assert_eq!(turn.responses[0].error.as_deref(), Some("boom"));
        assert_eq!(turn.responses[0].content, "");
        assert_eq!(turn.responses[1].content, "partial");
        assert_eq!(turn.responses[1].status, ResponseStatus::Error);
    }

    #[test]
    fn test_replayed_terminal_is_noop() {
        let mut r = TurnReconciler::new();
        r.begin_turn("q", &models(&["m1"]));
        r.apply(started("c1"));
        r.apply(token("m1", "ab"));
        r.apply(complete("m1", "ab", None));
        assert_eq!(r.apply(complete("m1", "ab", None)), Applied::Ignored);
        assert_eq!(r.apply(token("m1", "late")), Applied::Ignored);
        r.apply(chat_complete("c1"));
        assert_eq!(r.turns()[0].responses.len(), 1);
        assert_eq!(r.turns()[0].responses[0].content, "ab");
    }

    #[test]
    fn test_turn_complete_marks_streaming_incomplete() {
        let mut r = TurnReconciler::new();
        r.begin_turn("q", &models(&["m1", "m2"]));
        r.apply(started("c1"));
        r.apply(complete("m1", "done", None));
        r.apply(token("m2", "half"));
        r.apply(chat_complete("c1"));

        let responses = &r.turns()[0].responses;
        assert_eq!(responses[1].error.as_deref(), Some(INCOMPLETE_ERROR));
        assert_eq!(responses[1].content, "half");
        assert!(responses.iter().all(AssistantResponse::is_terminal));
    }

    #[test]
    fn test_disconnect_leaves_turn_unresolved() {
        let mut r = TurnReconciler::new();
        r.begin_turn("q", &models(&["m1", "m2"]));
        r.apply(started("c1"));
        r.apply(complete("m1", "one", None));
        r.apply(token("m2", "tw"));
        r.on_disconnect();

        assert!(r.turns().is_empty());
        assert_eq!(r.unresolved().len(), 1);
        assert_eq!(r.unresolved()[0].conversation_id, Some("c1".into()));
        assert_eq!(r.apply(chat_complete("c1")), Applied::Ignored);

        // A later turn starts cleanly
        r.begin_turn("again", &models(&["m1"]));
        r.apply(started("c1"));
        r.apply(complete("m1", "fresh", None));
        assert_eq!(r.apply(chat_complete("c1")), Applied::TurnCompleted);
        assert_eq!(r.turns().len(), 1);
        assert_eq!(r.unresolved().len(), 1);
    }

    #[test]
    fn test_newer_turn_started_discards_stale_buffers() {
        let mut r = TurnReconciler::new();
        r.apply(started("c1"));
        r.apply(token("m1", "stale"));
        assert_eq!(r.apply(started("c1")), Applied::TurnStarted("c1".into()));
        assert_eq!(r.unresolved().len(), 1);
        assert!(r.pending_responses().is_empty());
    }

    #[test]
    fn test_rejected_before_start() {
        let mut r = TurnReconciler::new();
        r.begin_turn("q", &[]);
        let applied = r.apply(ServerEvent::error("No models selected"));
        assert_eq!(applied, Applied::TurnRejected("No models selected".into()));
        assert!(!r.is_pending());
        assert!(r.unresolved().is_empty());
        assert_eq!(r.last_error(), Some("No models selected"));
    }

    #[test]
    fn test_select_best() {
        let mut r = TurnReconciler::new();
        r.begin_turn("q", &models(&["m1", "m2"]));
        r.apply(started("c1"));
        r.apply(complete("m1", "one", None));

        let streaming_id = r.pending_response(&"m2".into()).unwrap().id.clone();
        assert_eq!(
            r.select_best(&streaming_id).unwrap_err(),
            ReconcileError::NotFinalized(streaming_id)
        );

        r.apply(complete("m2", "two", None));
        r.apply(chat_complete("c1"));

        r.select_best(&"msg-m1".into()).unwrap();
        r.select_best(&"msg-m2".into()).unwrap();
        let flags: Vec<_> = r.turns()[0].responses.iter().map(|x| x.is_selected).collect();
        assert_eq!(flags, vec![false, true]);

        let missing = MessageId::from("nope");
        assert_eq!(r.select_best(&missing).unwrap_err(), ReconcileError::UnknownMessage(missing));
    }

    #[test]
    fn test_reload_clears_unresolved_for_conversation() {
        let mut r = TurnReconciler::new();
        r.begin_turn("q", &models(&["m1"]));
        r.apply(started("c1"));
        r.on_disconnect();
        assert_eq!(r.unresolved().len(), 1);

        let mut conversation = Conversation::new(Some("t".into()));
        conversation.id = "c1".into();
        r.reload(conversation);
        assert!(r.unresolved().is_empty());
        assert_eq!(r.conversation_id(), Some(&ConversationId::from("c1")));
    }
}
