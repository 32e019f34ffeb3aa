//! Stream Multiplexer
//!
//! Merges the per-model fragment streams of one turn into the session's
//! single outbound event queue, tagging every event with its model.
//!
//! # Ordering
//!
//! Each model gets exactly one [`ModelEmitter`]. The emitter awaits every
//! send before accepting the next fragment, and the outbound queue is FIFO,
//! so one model's events leave in emission order. Different models
//! interleave freely. Terminal calls consume the emitter, so nothing can be
//! emitted for a model after its terminal event.
//!
//! [`TurnMultiplexer::complete`] finalizes any model that never reached a
//! terminal state before it emits `chat_complete`, so the turn-complete
//! event always follows every model's terminal event.
//!
//! # Disconnects
//!
//! A closed outbound queue is not an error here. Responses keep
//! accumulating so the finished turn can still be persisted.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::backend::CompletionSummary;
use crate::conversation::AssistantResponse;
use crate::messages::{ConversationId, MessageId, ModelId};
use crate::protocol::ServerEvent;

/// Error attached to responses still streaming when the turn is closed
pub const INCOMPLETE_ERROR: &str = "incomplete";

/// Session-wide outbound gate
#[derive(Clone, Debug)]
pub struct Multiplexer {
    outbound: mpsc::Sender<ServerEvent>,
}

impl Multiplexer {
    /// Wrap an existing outbound queue
    #[must_use]
    pub fn new(outbound: mpsc::Sender<ServerEvent>) -> Self {
        Self { outbound }
    }

    /// Create a multiplexer and the receiving end of its queue
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    /// Send a turn-level event. Returns false if the receiver is gone.
    pub async fn send(&self, event: ServerEvent) -> bool {
        send_event(&self.outbound, event).await
    }

    /// Whether the receiving side has hung up
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    /// Announce a turn and start tracking its responses
    ///
    /// `conversation_started` is sent before this returns, so it precedes
    /// every event of the turn.
    pub async fn start_turn(
        &self,
        conversation_id: ConversationId,
        responses: Vec<AssistantResponse>,
    ) -> TurnMultiplexer {
        self.send(ServerEvent::ConversationStarted {
            conversation_id: conversation_id.clone(),
        })
        .await;

        let order = responses.iter().map(|r| r.model_id.clone()).collect();
        let slots = responses
            .into_iter()
            .map(|r| (r.model_id.clone(), r))
            .collect();

        TurnMultiplexer {
            outbound: self.outbound.clone(),
            conversation_id,
            order,
            slots: Arc::new(Mutex::new(slots)),
            issued: Mutex::new(HashSet::new()),
        }
    }
}

/// Event tracker for one turn
#[derive(Debug)]
pub struct TurnMultiplexer {
    outbound: mpsc::Sender<ServerEvent>,
    conversation_id: ConversationId,
    order: Vec<ModelId>,
    slots: Arc<Mutex<HashMap<ModelId, AssistantResponse>>>,
    issued: Mutex<HashSet<ModelId>>,
}

impl TurnMultiplexer {
    /// Conversation the turn belongs to
    #[must_use]
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Hand out the emitter of one model; `None` if unknown or already issued
    #[must_use]
    pub fn emitter(&self, model_id: &ModelId) -> Option<ModelEmitter> {
        if !self.slots.lock().contains_key(model_id) {
            return None;
        }
        if !self.issued.lock().insert(model_id.clone()) {
            return None;
        }
        Some(ModelEmitter {
            model_id: model_id.clone(),
            outbound: self.outbound.clone(),
            slots: Arc::clone(&self.slots),
        })
    }

    /// Models that have not reached a terminal state yet
    #[must_use]
    pub fn outstanding(&self) -> Vec<ModelId> {
        let slots = self.slots.lock();
        self.order
            .iter()
            .filter(|id| slots.get(*id).is_some_and(|r| !r.is_terminal()))
            .cloned()
            .collect()
    }

    /// Snapshot of one model's response
    #[must_use]
    pub fn response(&self, model_id: &ModelId) -> Option<AssistantResponse> {
        self.slots.lock().get(model_id).cloned()
    }

    /// Fail every outstanding model with `error`, emitting their terminals.
    /// Returns how many were failed.
    pub async fn fail_outstanding(&self, error: &str) -> usize {
        let mut failed = 0;
        for model_id in self.outstanding() {
            let finalized = {
                let mut slots = self.slots.lock();
                slots.get_mut(&model_id).and_then(|response| {
                    response
                        .fail(error, None)
                        .then(|| response.clone())
                })
            };
            if let Some(response) = finalized {
                debug!(model_id = %model_id, error, "Finalizing outstanding model");
                send_event(&self.outbound, ServerEvent::model_complete(&response)).await;
                failed += 1;
            }
        }
        failed
    }

    /// Close the turn: finalize stragglers as incomplete, emit
    /// `chat_complete`, and return the responses in dispatch order.
    pub async fn complete(self, user_message_id: MessageId) -> Vec<AssistantResponse> {
        self.fail_outstanding(INCOMPLETE_ERROR).await;

        let responses = {
            let mut slots = self.slots.lock();
            self.order
                .iter()
                .filter_map(|id| slots.remove(id))
                .collect::<Vec<_>>()
        };

        send_event(
            &self.outbound,
            ServerEvent::ChatComplete {
                conversation_id: self.conversation_id.clone(),
                user_message_id,
            },
        )
        .await;
        responses
    }
}

/// Sole producer of one model's events within a turn
#[derive(Debug)]
pub struct ModelEmitter {
    model_id: ModelId,
    outbound: mpsc::Sender<ServerEvent>,
    slots: Arc<Mutex<HashMap<ModelId, AssistantResponse>>>,
}

impl ModelEmitter {
    /// Model this emitter speaks for
    #[must_use]
    pub fn model_id(&self) -> &ModelId {
        &self.model_id
    }

    /// Append a fragment to the response and forward it
    pub async fn token(&mut self, fragment: String) {
        if fragment.is_empty() {
            return;
        }
        let accepted = self
            .slots
            .lock()
            .get_mut(&self.model_id)
            .is_some_and(|response| response.append(&fragment));
        if !accepted {
            trace!(model_id = %self.model_id, "Dropping fragment after terminal");
            return;
        }
        trace!(model_id = %self.model_id, len = fragment.len(), "Token");
        send_event(
            &self.outbound,
            ServerEvent::Token {
                model_id: self.model_id.clone(),
                token: fragment,
            },
        )
        .await;
    }

    /// Finalize as a success and emit `model_complete`
    pub async fn complete(self, summary: &CompletionSummary) -> Option<AssistantResponse> {
        self.finalize(|response| response.finish(summary)).await
    }

    /// Finalize as an error and emit `model_complete` with `error` set
    pub async fn fail(self, error: String, latency_ms: Option<u64>) -> Option<AssistantResponse> {
        self.finalize(|response| response.fail(error, latency_ms)).await
    }

    async fn finalize(
        self,
        apply: impl FnOnce(&mut AssistantResponse) -> bool,
    ) -> Option<AssistantResponse> {
        let finalized = {
            let mut slots = self.slots.lock();
            let response = slots.get_mut(&self.model_id)?;
            apply(response).then(|| response.clone())
        }?;
        send_event(&self.outbound, ServerEvent::model_complete(&finalized)).await;
        Some(finalized)
    }
}

async fn send_event(outbound: &mpsc::Sender<ServerEvent>, event: ServerEvent) -> bool {
    let kind = event.kind();
    if outbound.send(event).await.is_err() {
        debug!(kind, "Outbound queue closed, event dropped");
        return false;
    }
    true
}
