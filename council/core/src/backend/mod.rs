//! Model Provider Integration
//!
//! Abstracted access to upstream language models through the
//! [`ModelProvider`] capability trait.
//!
//! # Available Providers
//!
//! - **OpenAI-compatible**: any `/chat/completions` endpoint that streams
//!   server-sent events (OpenAI, Groq, DeepSeek, Together, OpenRouter, xAI,
//!   Mistral, Gemini's OpenAI surface, ...)
//! - **Scripted**: deterministic offline models for demos and tests
//!
//! # Usage
//!
//! ```ignore
//! use council_core::backend::{ChatMessage, CompletionRequest, ModelProvider};
//!
//! let request = CompletionRequest::new("gpt-4o", vec![ChatMessage::user("Hello!")]);
//! let mut rx = provider.stream_completion(&request).await?;
//! while let Some(token) = rx.recv().await { /* ... */ }
//! ```

mod openai;
mod scripted;
mod traits;

pub use openai::{parse_event_data, OpenAiCompatibleBackend, SseEvent};
pub use scripted::{ScriptStep, ScriptedBackend, ScriptedModel};
pub use traits::{
    ChatMessage, CompletionRequest, CompletionSummary, ModelProvider, StreamingToken,
};
