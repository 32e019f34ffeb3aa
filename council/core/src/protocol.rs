//! Wire Protocol
//!
//! JSON messages exchanged over the duplex channel. Every message is one
//! object with a `type` discriminator.
//!
//! Client to server:
//!
//! ```json
//! {"type":"chat","conversation_id":null,"message":"Say hi","models":["m1","m2"]}
//! ```
//!
//! Server to client: `conversation_started`, `token`, `model_complete`,
//! `chat_complete` and `error`. A `model_complete` whose `error` is set is
//! the failure terminal of that model; its `content` then holds whatever
//! partial text was streamed.
//!
//! Receivers should not match on [`ServerEvent`] directly. [`TurnEvent`]
//! folds the wire shapes into one case per lifecycle event.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::conversation::AssistantResponse;
use crate::messages::{ConversationId, MessageId, ModelId};

/// Wire-level decode errors
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Not valid JSON, or a known type with the wrong shape
    #[error("{0}")]
    Malformed(String),

    /// Valid JSON with an unrecognised `type`
    #[error("Unknown message type: {0}")]
    UnknownType(String),

    /// Frame exceeds the configured size limit
    #[error("Message too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Received frame size in bytes
        size: usize,
        /// Configured limit in bytes
        max: usize,
    },
}

/// Requests sent by clients
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Start a turn
    Chat {
        /// Conversation to continue; `None` starts a new one
        #[serde(default)]
        conversation_id: Option<ConversationId>,
        /// Prompt text
        #[serde(default)]
        message: String,
        /// Models to ask
        #[serde(default)]
        models: Vec<ModelId>,
    },
}

impl ClientRequest {
    /// Build a chat request
    pub fn chat(
        conversation_id: Option<ConversationId>,
        message: impl Into<String>,
        models: Vec<ModelId>,
    ) -> Self {
        Self::Chat {
            conversation_id,
            message: message.into(),
            models,
        }
    }
}

/// Events sent by the server
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    // ============================================
    // Turn lifecycle
    // ============================================
    /// The turn was accepted and bound to a conversation
    ConversationStarted {
        /// Conversation the turn belongs to
        conversation_id: ConversationId,
    },

    /// The turn finished; every model has reached a terminal state
    ChatComplete {
        /// Conversation the turn belongs to
        conversation_id: ConversationId,
        /// Persisted identifier of the prompt
        user_message_id: MessageId,
    },

    // ============================================
    // Per-model stream
    // ============================================
    /// One fragment of one model's answer
    Token {
        /// Originating model
        model_id: ModelId,
        /// Text fragment
        token: String,
    },

    /// Terminal event of one model (success when `error` is null)
    ModelComplete {
        /// Originating model
        model_id: ModelId,
        /// Display name
        model_name: String,
        /// Concatenation of every fragment sent for this model
        content: String,
        /// Prompt tokens, if reported
        tokens_input: Option<u32>,
        /// Completion tokens, if reported
        tokens_output: Option<u32>,
        /// Upstream latency
        latency_ms: Option<u64>,
        /// Failure description; `None` on success
        error: Option<String>,
        /// Persisted identifier of the response
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
    },

    // ============================================
    // Errors
    // ============================================
    /// Request-level failure, or a model failure when `model_id` is set
    Error {
        /// Human-readable description
        message: String,
        /// Failed model, absent for request-level errors
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model_id: Option<ModelId>,
    },
}

impl ServerEvent {
    /// Request-level error
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            model_id: None,
        }
    }

    /// Terminal event describing a finalized response
    #[must_use]
    pub fn model_complete(response: &AssistantResponse) -> Self {
        Self::ModelComplete {
            model_id: response.model_id.clone(),
            model_name: response.model_name.clone(),
            content: response.content.clone(),
            tokens_input: response.tokens_input,
            tokens_output: response.tokens_output,
            latency_ms: response.latency_ms,
            error: response.error.clone(),
            message_id: Some(response.id.clone()),
        }
    }

    /// Wire name of this event
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConversationStarted { .. } => "conversation_started",
            Self::ChatComplete { .. } => "chat_complete",
            Self::Token { .. } => "token",
            Self::ModelComplete { .. } => "model_complete",
            Self::Error { .. } => "error",
        }
    }

    /// Model this event belongs to, if any
    #[must_use]
    pub fn model_id(&self) -> Option<&ModelId> {
        match self {
            Self::Token { model_id, .. } | Self::ModelComplete { model_id, .. } => Some(model_id),
            Self::Error { model_id, .. } => model_id.as_ref(),
            Self::ConversationStarted { .. } | Self::ChatComplete { .. } => None,
        }
    }
}

/// Final figures of one model's response as seen by a receiver
#[derive(Clone, Debug, PartialEq)]
pub struct Completion {
    /// Model display name
    pub model_name: String,
    /// Full content (partial text for failures)
    pub content: String,
    /// Prompt tokens
    pub tokens_input: Option<u32>,
    /// Completion tokens
    pub tokens_output: Option<u32>,
    /// Upstream latency
    pub latency_ms: Option<u64>,
    /// Persisted identifier, when the server supplied one
    pub message_id: Option<MessageId>,
}

/// One case per turn lifecycle event
#[derive(Clone, Debug, PartialEq)]
pub enum TurnEvent {
    /// `conversation_started`
    TurnStarted {
        /// Bound conversation
        conversation_id: ConversationId,
    },
    /// `token`
    Token {
        /// Originating model
        model_id: ModelId,
        /// Text fragment
        fragment: String,
    },
    /// `model_complete` without error
    ModelComplete {
        /// Originating model
        model_id: ModelId,
        /// Final content and figures
        completion: Completion,
    },
    /// `model_complete` with error, or `error` carrying a model id
    ModelError {
        /// Failed model
        model_id: ModelId,
        /// Failure description
        error: String,
        /// Partial content and figures, when the server sent them
        completion: Option<Completion>,
    },
    /// `chat_complete`
    TurnComplete {
        /// Conversation the turn belongs to
        conversation_id: ConversationId,
        /// Persisted identifier of the prompt
        user_message_id: MessageId,
    },
    /// `error` without a model id
    TurnError {
        /// Human-readable description
        message: String,
    },
}

impl From<ServerEvent> for TurnEvent {
    fn from(event: ServerEvent) -> Self {
        match event {
            ServerEvent::ConversationStarted { conversation_id } => Self::TurnStarted { conversation_id },
            ServerEvent::Token { model_id, token } => Self::Token {
                model_id,
                fragment: token,
            },
            ServerEvent::ModelComplete {
                model_id,
                model_name,
                content,
                tokens_input,
                tokens_output,
                latency_ms,
                error,
                message_id,
            } => {
                let completion = Completion {
                    model_name,
                    content,
                    tokens_input,
                    tokens_output,
                    latency_ms,
                    message_id,
                };
                match error {
                    Some(error) => Self::ModelError {
                        model_id,
                        error,
                        completion: Some(completion),
                    },
                    None => Self::ModelComplete { model_id, completion },
                }
            }
            ServerEvent::ChatComplete {
                conversation_id,
                user_message_id,
            } => Self::TurnComplete {
                conversation_id,
                user_message_id,
            },
            ServerEvent::Error {
                message,
                model_id: Some(model_id),
            } => Self::ModelError {
                model_id,
                error: message,
                completion: None,
            },
            ServerEvent::Error {
                message,
                model_id: None,
            } => Self::TurnError { message },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_chat_request_wire_shape() {
        let request = ClientRequest::chat(None, "Say hi", vec!["m1".into(), "m2".into()]);
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({"type": "chat", "conversation_id": null, "message": "Say hi", "models": ["m1", "m2"]})
        );
    }

    #[test]
    fn test_chat_request_fields_default() {
        let request: ClientRequest = serde_json::from_str(r#"{"type":"chat"}"#).unwrap();
        assert_eq!(request, ClientRequest::chat(None, "", Vec::new()));
    }

    #[test]
    fn test_model_complete_serializes_null_error() {
        let event = ServerEvent::ModelComplete {
            model_id: "m1".into(),
            model_name: "M1".into(),
            content: "Hi".into(),
            tokens_input: Some(3),
            tokens_output: None,
            latency_ms: Some(20),
            error: None,
            message_id: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "model_complete");
        assert!(value["error"].is_null());
        assert!(value.get("message_id").is_none());
    }

    #[test]
    fn test_error_without_model_omits_field() {
        let value = serde_json::to_value(ServerEvent::error("Invalid JSON")).unwrap();
        assert_eq!(value, json!({"type": "error", "message": "Invalid JSON"}));
    }

    #[test]
    fn test_turn_event_folds_model_errors() {
        let failed: ServerEvent = serde_json::from_value(json!({
            "type": "model_complete", "model_id": "m2", "model_name": "M2", "content": "par",
            "tokens_input": null, "tokens_output": null, "latency_ms": null, "error": "timeout"
        }))
        .unwrap();
        assert!(matches!(
            TurnEvent::from(failed),
            TurnEvent::ModelError { ref error, completion: Some(ref c), .. } if error == "timeout" && c.content == "par"
        ));

        let per_model = ServerEvent::Error {
            message: "boom".into(),
            model_id: Some("m1".into()),
        };
        assert!(matches!(TurnEvent::from(per_model), TurnEvent::ModelError { completion: None, .. }));

        assert_eq!(
            TurnEvent::from(ServerEvent::error("bad")),
            TurnEvent::TurnError { message: "bad".into() }
        );
    }

    #[test]
    fn test_event_model_id() {
        let token = ServerEvent::Token {
            model_id: "m1".into(),
            token: "x".into(),
        };
        assert_eq!(token.model_id().map(ModelId::as_str), Some("m1"));
        assert_eq!(token.kind(), "token");
        assert!(ServerEvent::error("x").model_id().is_none());
    }
}
