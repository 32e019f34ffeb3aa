//! Model Provider Traits
//!
//! The orchestrator sees every upstream model through one capability: given
//! a model and a message history, produce a lazy, finite sequence of text
//! fragments terminated by either a completion summary or an error. Provider
//! specifics (URLs, auth headers, SSE parsing) stay behind this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::messages::{MessageRole, ModelId};
use crate::registry::ModelDescriptor;

/// Token stream events from a provider
#[derive(Clone, Debug, PartialEq)]
pub enum StreamingToken {
    /// An incremental text fragment
    Token(String),
    /// Response completed successfully
    Complete(CompletionSummary),
    /// Error occurred during streaming
    Error(String),
}

impl StreamingToken {
    /// Whether this event ends the stream
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Token(_))
    }
}

/// Usage figures reported when a stream completes
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionSummary {
    /// Prompt tokens (if the provider reported them)
    pub tokens_input: Option<u32>,
    /// Completion tokens (if the provider reported them)
    pub tokens_output: Option<u32>,
    /// Upstream latency in milliseconds
    pub latency_ms: Option<u64>,
}

/// One message of chat history sent upstream
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Who said it
    pub role: MessageRole,
    /// What was said
    pub content: String,
}

impl ChatMessage {
    /// A user message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    /// An assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// A streaming completion request for one model
#[derive(Clone, Debug)]
pub struct CompletionRequest {
    /// Model to query
    pub model: ModelId,
    /// Full history, ending with the new prompt
    pub messages: Vec<ChatMessage>,
    /// Temperature (0.0-2.0)
    pub temperature: f32,
    /// Maximum tokens in response (0 = provider default)
    pub max_tokens: u32,
}

impl CompletionRequest {
    /// Create a request with default sampling settings
    pub fn new(model: impl Into<ModelId>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: 0.7,
            max_tokens: 0,
        }
    }

    /// Set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.clamp(0.0, 2.0);
        self
    }

    /// Set max tokens
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// The newest user prompt in the history
    #[must_use]
    pub fn prompt(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.as_str())
    }
}

/// Model capability provider
///
/// Implement this trait to plug a family of upstream models into the
/// dispatcher.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider name for logs (e.g., "OpenAI-compatible", "Scripted")
    fn name(&self) -> &str;

    /// Every model this provider knows about, credentialed or not
    async fn list_models(&self) -> anyhow::Result<Vec<ModelDescriptor>>;

    /// Start a streaming completion
    ///
    /// Returns a channel receiver that yields fragments as they arrive,
    /// followed by exactly one terminal `Complete` or `Error`. A receiver
    /// that closes without a terminal event is treated as a failure.
    async fn stream_completion(
        &self,
        request: &CompletionRequest,
    ) -> anyhow::Result<mpsc::Receiver<StreamingToken>>;

    /// Get the descriptor for a specific model
    async fn descriptor(&self, model: &ModelId) -> anyhow::Result<Option<ModelDescriptor>> {
        let models = self.list_models().await?;
        Ok(models.into_iter().find(|m| &m.id == model))
    }

    /// Models whose credentials are configured
    async fn available_models(&self) -> anyhow::Result<Vec<ModelDescriptor>> {
        let models = self.list_models().await?;
        Ok(models.into_iter().filter(|m| m.has_api_key).collect())
    }
}
