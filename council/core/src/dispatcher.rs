//! Turn Dispatcher
//!
//! Accepts one chat request per session at a time and fans it out to one
//! independent subtask per requested model.
//!
//! # Turn Lifecycle
//!
//! ```text
//! validate ─► acquire lease ─► resolve conversation ─► conversation_started
//!     │                                                       │
//!     └─ InvalidRequest / TurnInProgress               spawn N subtasks
//!                                                             │
//!                       token… model_complete (per model, any interleaving)
//!                                                             │
//!          join all ─► persist turn ─► record usage ─► release lease ─► chat_complete
//! ```
//!
//! Each subtask carries its own upstream deadline. A failing, hanging or
//! panicking subtask becomes that model's error terminal and never touches
//! its siblings.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{ChatMessage, CompletionRequest, ModelProvider, StreamingToken};
use crate::conversation::{AssistantResponse, UserMessage};
use crate::history::{HistoryError, HistoryStore};
use crate::messages::{ConversationId, MessageId, ModelId};
use crate::multiplexer::{ModelEmitter, Multiplexer, TurnMultiplexer};
use crate::protocol::{ClientRequest, ServerEvent};
use crate::registry::{ModelCost, ModelDescriptor};
use crate::session::{Session, TurnLease};
use crate::usage::{UsageRecord, UsageRecorder};

/// Error given to a model whose subtask panicked or was cancelled
pub const ABORTED_ERROR: &str = "model task aborted";

/// Dispatch errors surfaced to the caller as a turn-level `error` event
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Empty prompt, empty model set, or unusable model
    #[error("{0}")]
    InvalidRequest(String),

    /// Another turn is in flight on this session
    #[error("A turn is already in progress for this session")]
    TurnInProgress,

    /// The history collaborator refused an operation
    #[error(transparent)]
    History(#[from] HistoryError),
}

/// Per-model upstream failures (rendered into the model's error terminal)
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum UpstreamError {
    /// No terminal event before the deadline
    #[error("Request timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// The provider failed to start or reported an error
    #[error("{0}")]
    Failure(String),
}

/// Dispatcher tuning
#[derive(Clone, Debug, PartialEq)]
pub struct DispatchConfig {
    /// Deadline for each model's whole upstream call
    pub upstream_timeout: Duration,
    /// Prior messages sent as context (0 = unlimited)
    pub max_context_messages: usize,
    /// Sampling temperature
    pub temperature: f32,
    /// Output cap (0 = provider default)
    pub max_tokens: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            upstream_timeout: Duration::from_secs(120),
            max_context_messages: 50,
            temperature: 0.7,
            max_tokens: 0,
        }
    }
}

/// A validated chat request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatRequest {
    /// Conversation to continue
    pub conversation_id: Option<ConversationId>,
    /// Prompt text
    pub prompt: String,
    /// Requested models, in request order
    pub models: Vec<ModelId>,
}

impl From<ClientRequest> for ChatRequest {
    fn from(request: ClientRequest) -> Self {
        match request {
            ClientRequest::Chat {
                conversation_id,
                message,
                models,
            } => Self {
                conversation_id,
                prompt: message,
                models,
            },
        }
    }
}

/// A finished turn as persisted
#[derive(Clone, Debug, PartialEq)]
pub struct CompletedTurn {
    /// Conversation the turn was appended to
    pub conversation_id: ConversationId,
    /// The prompt
    pub user_message: UserMessage,
    /// One terminal response per requested model, in request order
    pub responses: Vec<AssistantResponse>,
}

/// Handle to a dispatched turn
#[derive(Debug)]
pub struct TurnHandle {
    /// Conversation the turn is bound to
    pub conversation_id: ConversationId,
    /// Identifier of the persisted user message
    pub user_message_id: MessageId,
    /// Response identifier assigned to each model, in request order
    pub responses: Vec<(ModelId, MessageId)>,
    task: JoinHandle<CompletedTurn>,
}

impl TurnHandle {
    /// Wait for the turn to finish
    ///
    /// # Errors
    ///
    /// Returns the join error if the driver task panicked or was cancelled.
    pub async fn wait(self) -> Result<CompletedTurn, tokio::task::JoinError> {
        self.task.await
    }
}

/// One model's share of a turn
struct ModelPlan {
    descriptor: ModelDescriptor,
    request: CompletionRequest,
    emitter: ModelEmitter,
}

/// Fans chat requests out to models
#[derive(Clone)]
pub struct Dispatcher {
    provider: Arc<dyn ModelProvider>,
    history: Arc<dyn HistoryStore>,
    usage: Arc<dyn UsageRecorder>,
    config: DispatchConfig,
}

impl Dispatcher {
    /// Create a dispatcher
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        history: Arc<dyn HistoryStore>,
        usage: Arc<dyn UsageRecorder>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            provider,
            history,
            usage,
            config,
        }
    }

    /// Dispatcher configuration
    #[must_use]
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// The history collaborator
    #[must_use]
    pub fn history(&self) -> &Arc<dyn HistoryStore> {
        &self.history
    }

    /// Handle one inbound request, reporting rejections on the channel
    pub async fn handle_request(
        &self,
        session: &Session,
        mux: &Multiplexer,
        request: ClientRequest,
    ) -> Option<TurnHandle> {
        match self.dispatch(session, mux, request.into()).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                debug!(session_id = %session.id, error = %e, "Chat request rejected");
                mux.send(ServerEvent::error(e.to_string())).await;
                None
            }
        }
    }

    /// Start a turn
    ///
    /// Returns once `conversation_started` has been queued. The model
    /// subtasks run under a driver task reachable through the handle.
    ///
    /// # Errors
    ///
    /// - `InvalidRequest` for an empty prompt, an empty model set, or a
    ///   model that is unknown or lacks credentials; nothing is created
    /// - `TurnInProgress` if the session already has a turn in flight
    /// - `History` if the conversation could not be resolved
    pub async fn dispatch(
        &self,
        session: &Session,
        mux: &Multiplexer,
        request: ChatRequest,
    ) -> Result<TurnHandle, DispatchError> {
        let prompt = request.prompt.trim().to_string();
        if prompt.is_empty() {
            return Err(DispatchError::InvalidRequest("Message cannot be empty".into()));
        }
        let model_ids = dedup_preserving_order(request.models);
        if model_ids.is_empty() {
            return Err(DispatchError::InvalidRequest("No models selected".into()));
        }
        let descriptors = self.resolve_models(&model_ids).await?;

        let lease = session.turn().try_acquire().ok_or(DispatchError::TurnInProgress)?;

        let conversation_id = self.resolve_conversation(request.conversation_id).await?;
        session.bind_conversation(conversation_id.clone());
        let user_message = UserMessage::new(prompt);

        let mut contexts = Vec::with_capacity(descriptors.len());
        for descriptor in &descriptors {
            let mut messages = self
                .history
                .context_for(&conversation_id, Some(&descriptor.id), self.config.max_context_messages)
                .await?;
            messages.push(ChatMessage::user(user_message.content.clone()));
            contexts.push(messages);
        }

        let responses: Vec<AssistantResponse> = descriptors
            .iter()
            .map(|d| AssistantResponse::streaming(MessageId::new(), d.id.clone(), d.name.clone()))
            .collect();
        let response_ids: Vec<(ModelId, MessageId)> = responses
            .iter()
            .map(|r| (r.model_id.clone(), r.id.clone()))
            .collect();
        lease.bind(
            conversation_id.clone(),
            response_ids.iter().map(|(_, id)| id.clone()).collect(),
        );

        let turn = mux.start_turn(conversation_id.clone(), responses).await;

        let mut plans = Vec::with_capacity(descriptors.len());
        for (descriptor, messages) in descriptors.into_iter().zip(contexts) {
            let Some(emitter) = turn.emitter(&descriptor.id) else {
                continue;
            };
            let request = CompletionRequest::new(descriptor.id.clone(), messages)
                .with_temperature(self.config.temperature)
                .with_max_tokens(self.config.max_tokens);
            plans.push(ModelPlan {
                descriptor,
                request,
                emitter,
            });
        }

        info!(
            session_id = %session.id,
            conversation_id = %conversation_id,
            models = plans.len(),
            "Turn dispatched"
        );

        let user_message_id = user_message.id.clone();
        let driver = self.clone();
        let task = tokio::spawn(async move { driver.drive_turn(lease, turn, user_message, plans).await });

        Ok(TurnHandle {
            conversation_id,
            user_message_id,
            responses: response_ids,
            task,
        })
    }

    /// Flag a persisted response as best of its turn
    ///
    /// # Errors
    ///
    /// `History(NotFinalized)` if the response belongs to the turn still in
    /// flight on this session; otherwise whatever the history store reports.
    pub async fn select_best(
        &self,
        session: &Session,
        message_id: &MessageId,
    ) -> Result<AssistantResponse, DispatchError> {
        if session.turn().holds_response(message_id) {
            return Err(HistoryError::NotFinalized(message_id.clone()).into());
        }
        Ok(self.history.select_best(message_id).await?)
    }

    async fn resolve_models(&self, model_ids: &[ModelId]) -> Result<Vec<ModelDescriptor>, DispatchError> {
        let mut descriptors = Vec::with_capacity(model_ids.len());
        for id in model_ids {
            let descriptor = self
                .provider
                .descriptor(id)
                .await
                .map_err(|e| DispatchError::InvalidRequest(format!("Model catalog unavailable: {e}")))?
                .ok_or_else(|| DispatchError::InvalidRequest(format!("Unknown model: {id}")))?;
            if !descriptor.has_api_key {
                return Err(DispatchError::InvalidRequest(format!(
                    "No API key configured for model: {id}"
                )));
            }
            descriptors.push(descriptor);
        }
        Ok(descriptors)
    }

    async fn resolve_conversation(
        &self,
        requested: Option<ConversationId>,
    ) -> Result<ConversationId, DispatchError> {
        if let Some(id) = requested {
            match self.history.get_conversation(&id).await {
                Ok(conversation) => return Ok(conversation.id),
                Err(HistoryError::ConversationNotFound(_)) => {
                    debug!(conversation_id = %id, "Unknown conversation, starting a new one");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(self.history.create_conversation(None).await?.id)
    }

    async fn drive_turn(
        self,
        lease: TurnLease,
        turn: TurnMultiplexer,
        user_message: UserMessage,
        plans: Vec<ModelPlan>,
    ) -> CompletedTurn {
        let mut costs = Vec::with_capacity(plans.len());
        let mut tasks = Vec::with_capacity(plans.len());
        for plan in plans {
            costs.push((plan.descriptor.id.clone(), plan.descriptor.cost()));
            let provider = Arc::clone(&self.provider);
            let timeout = self.config.upstream_timeout;
            let model_id = plan.descriptor.id.clone();
            let task = tokio::spawn(run_model(provider, plan.request, plan.emitter, timeout));
            tasks.push((model_id, task));
        }

        for (model_id, task) in tasks {
            if let Err(e) = task.await {
                warn!(model_id = %model_id, error = %e, "Model task aborted");
            }
        }
        turn.fail_outstanding(ABORTED_ERROR).await;

        let conversation_id = turn.conversation_id().clone();
        let responses: Vec<AssistantResponse> = costs
            .iter()
            .filter_map(|(id, _)| turn.response(id))
            .collect();

        if let Err(e) = self
            .history
            .append_turn(&conversation_id, user_message.clone(), responses.clone())
            .await
        {
            warn!(conversation_id = %conversation_id, error = %e, "Failed to persist turn");
        }

        for response in &responses {
            let cost = costs
                .iter()
                .find(|(id, _)| id == &response.model_id)
                .map_or_else(ModelCost::default, |(_, cost)| *cost);
            self.usage
                .record(UsageRecord {
                    model_id: response.model_id.clone(),
                    model_name: response.model_name.clone(),
                    tokens_input: response.tokens_input,
                    tokens_output: response.tokens_output,
                    latency_ms: response.latency_ms,
                    cost,
                    is_error: response.error.is_some(),
                    timestamp: Utc::now(),
                })
                .await;
        }

        let elapsed_ms = lease.elapsed_ms();
        // Free the slot before announcing completion so a client reacting to
        // chat_complete can submit its next turn immediately
        drop(lease);
        let responses = turn.complete(user_message.id.clone()).await;

        info!(
            conversation_id = %conversation_id,
            succeeded = responses.iter().filter(|r| r.error.is_none()).count(),
            failed = responses.iter().filter(|r| r.error.is_some()).count(),
            elapsed_ms,
            "Turn complete"
        );

        CompletedTurn {
            conversation_id,
            user_message,
            responses,
        }
    }
}

/// Stream one model into its emitter until a terminal event or the deadline
async fn run_model(
    provider: Arc<dyn ModelProvider>,
    request: CompletionRequest,
    mut emitter: ModelEmitter,
    timeout: Duration,
) -> Option<AssistantResponse> {
    let started = Instant::now();
    let deadline = started + timeout;
    let model_id = request.model.clone();
    let elapsed = || Some(u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX));

    let failure = match tokio::time::timeout_at(deadline, provider.stream_completion(&request)).await {
        Err(_) => UpstreamError::Timeout(timeout),
        Ok(Err(e)) => UpstreamError::Failure(e.to_string()),
        Ok(Ok(mut rx)) => loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(StreamingToken::Token(fragment))) => emitter.token(fragment).await,
                Ok(Some(StreamingToken::Complete(mut summary))) => {
                    if summary.latency_ms.is_none() {
                        summary.latency_ms = elapsed();
                    }
                    debug!(model_id = %model_id, latency_ms = ?summary.latency_ms, "Model complete");
                    return emitter.complete(&summary).await;
                }
                Ok(Some(StreamingToken::Error(e))) => break UpstreamError::Failure(e),
                Ok(None) => break UpstreamError::Failure("Stream disconnected unexpectedly".into()),
                Err(_) => break UpstreamError::Timeout(timeout),
            }
        },
    };

    warn!(model_id = %model_id, error = %failure, "Model failed");
    emitter.fail(failure.to_string(), elapsed()).await
}

fn dedup_preserving_order(models: Vec<ModelId>) -> Vec<ModelId> {
    let mut seen = HashSet::new();
    models
        .into_iter()
        .filter(|m| !m.as_str().trim().is_empty() && seen.insert(m.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ScriptStep, ScriptedBackend, ScriptedModel};
    use crate::history::InMemoryHistory;
    use crate::usage::UsageLedger;
    use pretty_assertions::assert_eq;

    struct Harness {
        dispatcher: Dispatcher,
        history: Arc<InMemoryHistory>,
        usage: Arc<UsageLedger>,
        session: Session,
        mux: Multiplexer,
        rx: tokio::sync::mpsc::Receiver<ServerEvent>,
    }

    fn harness(backend: ScriptedBackend) -> Harness {
        let history = Arc::new(InMemoryHistory::new());
        let usage = Arc::new(UsageLedger::new());
        let config = DispatchConfig {
            upstream_timeout: Duration::from_secs(30),
            ..DispatchConfig::default()
        };
        let dispatcher = Dispatcher::new(Arc::new(backend), history.clone(), usage.clone(), config);
        let (mux, rx) = Multiplexer::channel(256);
        Harness {
            dispatcher,
            history,
            usage,
            session: Session::new(),
            mux,
            rx,
        }
    }

    fn chat(models: &[&str]) -> ChatRequest {
        ChatRequest {
            conversation_id: None,
            prompt: "Say hi".into(),
            models: models.iter().map(|m| ModelId::from(*m)).collect(),
        }
    }

    #[tokio::test]
    async fn test_rejects_empty_prompt_and_models() {
        let h = harness(ScriptedBackend::new().with_model(ScriptedModel::replying("m1", ["x"])));

        let mut request = chat(&["m1"]);
        request.prompt = "   ".into();
        let err = h.dispatcher.dispatch(&h.session, &h.mux, request).await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidRequest(_)));

        let err = h.dispatcher.dispatch(&h.session, &h.mux, chat(&[])).await.unwrap_err();
        assert_eq!(err.to_string(), "No models selected");
        assert!(h.history.is_empty());
        assert!(!h.session.turn().is_busy());
    }

    #[tokio::test]
    async fn test_rejects_unknown_and_uncredentialed_models() {
        let backend = ScriptedBackend::new()
            .with_model(ScriptedModel::replying("m1", ["x"]))
            .with_model(ScriptedModel::replying("locked", ["x"]).without_credentials());
        let h = harness(backend);

        let err = h.dispatcher.dispatch(&h.session, &h.mux, chat(&["m1", "ghost"])).await.unwrap_err();
        assert_eq!(err.to_string(), "Unknown model: ghost");

        let err = h.dispatcher.dispatch(&h.session, &h.mux, chat(&["locked"])).await.unwrap_err();
        assert!(err.to_string().contains("No API key"));
        assert!(h.history.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_persists_turn_and_records_usage() {
        let h = harness(
            ScriptedBackend::new()
                .with_model(ScriptedModel::replying("m1", ["Hi", " there"]))
                .with_model(ScriptedModel::new("m2").then(ScriptStep::Fail("quota exceeded".into()))),
        );

        let handle = h.dispatcher.dispatch(&h.session, &h.mux, chat(&["m1", "m2", "m1"])).await.unwrap();
        let turn = handle.wait().await.unwrap();

        assert_eq!(turn.responses.len(), 2);
        assert_eq!(turn.responses[0].content, "Hi there");
        assert_eq!(turn.responses[0].error, None);
        assert!(turn.responses[0].latency_ms.is_some());
        assert_eq!(turn.responses[1].error.as_deref(), Some("quota exceeded"));

        let stored = h.history.get_conversation(&turn.conversation_id).await.unwrap();
        assert_eq!(stored.turns.len(), 1);
        assert_eq!(stored.title.as_deref(), Some("Say hi"));
        assert_eq!(h.usage.len(), 2);
        assert!(!h.session.turn().is_busy());
    }

    #[tokio::test]
    async fn test_unknown_conversation_starts_fresh() {
        let mut h = harness(ScriptedBackend::new().with_model(ScriptedModel::replying("m1", ["x"])));
        let mut request = chat(&["m1"]);
        request.conversation_id = Some(ConversationId::from("does-not-exist"));

        let handle = h.dispatcher.dispatch(&h.session, &h.mux, request).await.unwrap();
        assert_ne!(handle.conversation_id.as_str(), "does-not-exist");

        let first = h.rx.recv().await.unwrap();
        assert_eq!(
            first,
            ServerEvent::ConversationStarted {
                conversation_id: handle.conversation_id.clone()
            }
        );
        handle.wait().await.unwrap();
        assert_eq!(h.session.conversation(), Some(h.history.list_conversations(1, 0).await[0].id.clone()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_chat_rejected_while_turn_in_flight() {
        let backend = ScriptedBackend::new().with_model(
            ScriptedModel::replying("slow", ["a", "b"]).with_fragment_delay(Duration::from_secs(1)),
        );
        let h = harness(backend);

        let first = h.dispatcher.dispatch(&h.session, &h.mux, chat(&["slow"])).await.unwrap();
        let err = h.dispatcher.dispatch(&h.session, &h.mux, chat(&["slow"])).await.unwrap_err();
        assert!(matches!(err, DispatchError::TurnInProgress));

        let turn = first.wait().await.unwrap();
        assert_eq!(turn.responses[0].content, "ab");
        assert!(h.dispatcher.dispatch(&h.session, &h.mux, chat(&["slow"])).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_model_times_out() {
        let h = harness(
            ScriptedBackend::new()
                .with_model(ScriptedModel::replying("m1", ["ok"]))
                .with_model(ScriptedModel::silent("m2")),
        );

        let turn = h
            .dispatcher
            .dispatch(&h.session, &h.mux, chat(&["m1", "m2"]))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(turn.responses[0].content, "ok");
        assert_eq!(turn.responses[1].error.as_deref(), Some("Request timed out after 30s"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_select_best_rejects_in_flight_response() {
        let h = harness(
            ScriptedBackend::new()
                .with_model(ScriptedModel::replying("m1", ["fast"]))
                .with_model(ScriptedModel::silent("m2")),
        );
        let handle = h.dispatcher.dispatch(&h.session, &h.mux, chat(&["m1", "m2"])).await.unwrap();
        let (_, m1_id) = handle.responses[0].clone();

        let err = h.dispatcher.select_best(&h.session, &m1_id).await.unwrap_err();
        assert!(matches!(err, DispatchError::History(HistoryError::NotFinalized(_))));

        handle.wait().await.unwrap();
        let selected = h.dispatcher.select_best(&h.session, &m1_id).await.unwrap();
        assert!(selected.is_selected);

        let missing = MessageId::new();
        let err = h.dispatcher.select_best(&h.session, &missing).await.unwrap_err();
        assert!(matches!(err, DispatchError::History(HistoryError::MessageNotFound(_))));
    }

    #[test]
    fn test_dedup_preserves_first_seen_order() {
        let ids = dedup_preserving_order(vec!["b".into(), "a".into(), "b".into(), "".into(), "c".into()]);
        let ids: Vec<_> = ids.iter().map(ModelId::as_str).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }
}
