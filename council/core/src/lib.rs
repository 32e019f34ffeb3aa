//! Council Core - Streaming Fan-Out Orchestration for LLM Council
//!
//! One prompt goes to several language models at once. Their token streams
//! come back interleaved over a single duplex channel, tagged by model, and
//! are reconciled into one consistent turn on the receiving side.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────── client ────────────────────────────┐
//! │  ChatClient ── DuplexChannel (reconnects)    TurnReconciler    │
//! └───────────────────────┼─────────────────────────────▲──────────┘
//!                 chat    │                             │ ServerEvent
//! ┌───────────────────────▼──────── server ────────────┼──────────┐
//! │  CouncilServer ── Session (TurnLease)               │          │
//! │        │                                            │          │
//! │   Dispatcher ──┬── model task m1 ──┐                │          │
//! │                ├── model task m2 ──┼── Multiplexer ─┘          │
//! │                └── model task mN ──┘   (one queue per session) │
//! │        │                                                       │
//! │   HistoryStore   UsageRecorder   ModelProvider / ModelRegistry │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Dispatcher`]: validates a chat request and runs one subtask per model
//! - [`Multiplexer`]: the per-session ordered outbound gate
//! - [`TurnReconciler`]: rebuilds per-model responses from events
//! - [`ModelProvider`]: streaming completion capability
//! - [`HistoryStore`] / [`UsageRecorder`]: collaborators fed by the dispatcher
//!
//! # Module Overview
//!
//! - [`backend`]: model providers (OpenAI-compatible HTTP, scripted)
//! - [`registry`]: providers, model descriptors, display names, pricing
//! - [`conversation`]: conversations, turns, responses
//! - [`dispatcher`]: turn fan-out
//! - [`multiplexer`]: event tagging and ordering
//! - [`reconciler`]: receiver-side state machine
//! - [`protocol`]: wire messages
//! - [`transport`]: framing and the WebSocket server/client
//! - [`history`], [`usage`]: in-memory collaborators
//! - [`config`]: TOML configuration

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
#[cfg(feature = "websocket")]
pub mod client;
pub mod config;
pub mod conversation;
pub mod dispatcher;
pub mod history;
pub mod messages;
pub mod multiplexer;
pub mod protocol;
pub mod reconciler;
pub mod registry;
pub mod session;
pub mod transport;
pub mod usage;

// Re-exports for convenience
pub use backend::{
    ChatMessage, CompletionRequest, CompletionSummary, ModelProvider, OpenAiCompatibleBackend,
    ScriptStep, ScriptedBackend, ScriptedModel, StreamingToken,
};
pub use conversation::{AssistantResponse, Conversation, ResponseStatus, SelectionError, Turn, UserMessage};
pub use dispatcher::{
    ChatRequest, CompletedTurn, DispatchConfig, DispatchError, Dispatcher, TurnHandle, UpstreamError,
};
pub use history::{ConversationSummary, HistoryError, HistoryStore, InMemoryHistory};
pub use messages::{ConversationId, MessageId, MessageRole, ModelId, SessionId};
pub use multiplexer::{ModelEmitter, Multiplexer, TurnMultiplexer};
pub use protocol::{ClientRequest, Completion, ProtocolError, ServerEvent, TurnEvent};
pub use reconciler::{Applied, ReconcileError, TurnReconciler, UnresolvedTurn};
pub use registry::{ModelCost, ModelDescriptor, ModelRegistry, ModelSpec, Provider, ProviderSpec, RegistryError};
pub use session::{Session, TurnLease, TurnSlot};
pub use usage::{UsageLedger, UsagePeriod, UsageRecord, UsageRecorder, UsageSummary};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ClientConfig, ConfigError, ConfigOverrides,
    ConfigSource, CouncilConfig, ServerConfig,
};

// Transport exports
#[cfg(feature = "websocket")]
pub use client::{ChatClient, ClientUpdate};
#[cfg(feature = "websocket")]
pub use transport::websocket::{ChannelError, ChannelState, CouncilServer, DuplexChannel};
