//! Chat Client
//!
//! Couples one [`DuplexChannel`] with one [`TurnReconciler`]. Channel
//! events are applied in receipt order by whoever polls [`ChatClient::next`].
//! A drop of the connection that carried the pending turn marks that turn
//! unresolved; drops of earlier connections that are still queued when a
//! new turn goes out leave it alone.

use tokio::sync::mpsc;
use tracing::debug;

use crate::config::ClientConfig;
use crate::conversation::{AssistantResponse, Conversation};
use crate::messages::{MessageId, ModelId};
use crate::protocol::ClientRequest;
use crate::reconciler::{Applied, ReconcileError, TurnReconciler};
use crate::transport::websocket::{ChannelError, ChannelEvent, ChannelState, DuplexChannel};

/// One processed channel event
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientUpdate {
    /// The connection changed state
    State(ChannelState),
    /// A server event was applied to the reconciler
    Applied(Applied),
}

/// Reconnecting chat client
pub struct ChatClient {
    channel: DuplexChannel,
    events: mpsc::Receiver<ChannelEvent>,
    reconciler: TurnReconciler,
    /// Connection generation the last request went out on
    turn_generation: Option<u64>,
}

impl ChatClient {
    /// Start connecting
    #[must_use]
    pub fn connect(config: &ClientConfig) -> Self {
        let (channel, events) = DuplexChannel::open(config);
        Self {
            channel,
            events,
            reconciler: TurnReconciler::new(),
            turn_generation: None,
        }
    }

    /// Current connection state
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.channel.state()
    }

    /// Local view of the conversation
    #[must_use]
    pub fn reconciler(&self) -> &TurnReconciler {
        &self.reconciler
    }

    /// Submit a prompt on the current conversation
    ///
    /// # Errors
    ///
    /// `NotConnected` while the channel is not open; no local turn is
    /// recorded in that case.
    pub async fn submit(&mut self, prompt: &str, models: Vec<ModelId>) -> Result<(), ChannelError> {
        let request = ClientRequest::chat(self.reconciler.conversation_id().cloned(), prompt, models.clone());
        let generation = self.channel.send_chat(&request).await?;
        self.reconciler.begin_turn(prompt, &models);
        self.turn_generation = Some(generation);
        Ok(())
    }

    /// Wait for the next channel event and apply it
    ///
    /// Returns `None` once the channel is gone.
    pub async fn next(&mut self) -> Option<ClientUpdate> {
        match self.events.recv().await? {
            ChannelEvent::State { state, generation } => {
                if state == ChannelState::Disconnected && self.turn_generation == Some(generation) {
                    self.reconciler.on_disconnect();
                    self.turn_generation = None;
                } else if state == ChannelState::Disconnected {
                    debug!(generation, "Ignoring close of an earlier connection");
                }
                Some(ClientUpdate::State(state))
            }
            ChannelEvent::Server(event) => {
                let applied = self.reconciler.apply(event);
                debug!(?applied, "Applied server event");
                Some(ClientUpdate::Applied(applied))
            }
        }
    }

    /// Process events until the channel is open
    ///
    /// Returns false if the channel went away first.
    pub async fn wait_open(&mut self) -> bool {
        if self.state() == ChannelState::Open {
            return true;
        }
        while let Some(update) = self.next().await {
            if update == ClientUpdate::State(ChannelState::Open) {
                return true;
            }
        }
        false
    }

    /// Process events until the pending turn finishes, is rejected, or the
    /// connection carrying it drops. Returns the last update handled.
    pub async fn finish_turn(&mut self) -> Option<ClientUpdate> {
        while let Some(update) = self.next().await {
            match &update {
                ClientUpdate::Applied(Applied::TurnCompleted | Applied::TurnRejected(_)) => return Some(update),
                ClientUpdate::State(ChannelState::Disconnected) if !self.reconciler.is_pending() => {
                    return Some(update)
                }
                _ => {}
            }
        }
        None
    }

    /// Replace local state with the persisted conversation
    pub fn reload(&mut self, conversation: Conversation) {
        self.reconciler.reload(conversation);
    }

    /// Flag a finalized response as best of its turn
    ///
    /// # Errors
    ///
    /// See [`TurnReconciler::select_best`].
    pub fn select_best(&mut self, message_id: &MessageId) -> Result<&AssistantResponse, ReconcileError> {
        self.reconciler.select_best(message_id)
    }
}
