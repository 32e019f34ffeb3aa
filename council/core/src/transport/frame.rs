//! Frame Codec
//!
//! Each duplex channel message is one text frame holding one JSON object.
//! Inbound frames are size-checked before parsing so a client cannot make
//! the server buffer arbitrarily large payloads.

use serde::Serialize;

use crate::protocol::{ClientRequest, ProtocolError, ServerEvent};

/// Default inbound frame limit (1 MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Serialize an outbound message to its text frame
///
/// # Errors
///
/// Returns `ProtocolError::Malformed` if serialization fails.
pub fn encode<T: Serialize>(msg: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(msg).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Decode an inbound client frame
///
/// # Errors
///
/// - `FrameTooLarge` if `text` exceeds `max_size` bytes
/// - `Malformed("Invalid JSON")` if `text` is not a JSON object
/// - `UnknownType` if `type` is missing or not a known request
/// - `Malformed` if a known request has fields of the wrong shape
pub fn decode_request(text: &str, max_size: usize) -> Result<ClientRequest, ProtocolError> {
    if text.len() > max_size {
        return Err(ProtocolError::FrameTooLarge {
            size: text.len(),
            max: max_size,
        });
    }

    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|_| ProtocolError::Malformed("Invalid JSON".to_string()))?;
    if !value.is_object() {
        return Err(ProtocolError::Malformed("Invalid JSON".to_string()));
    }

    match value.get("type").and_then(serde_json::Value::as_str) {
        Some("chat") => serde_json::from_value(value)
            .map_err(|e| ProtocolError::Malformed(format!("Invalid chat request: {e}"))),
        Some(other) => Err(ProtocolError::UnknownType(other.to_string())),
        None => Err(ProtocolError::UnknownType(
            value.get("type").map_or_else(|| "None".to_string(), ToString::to_string),
        )),
    }
}

/// Decode an outbound server frame (client side)
///
/// # Errors
///
/// Returns `Malformed` for invalid JSON and `UnknownType` for an
/// unrecognised `type`.
pub fn decode_event(text: &str) -> Result<ServerEvent, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|_| ProtocolError::Malformed("Invalid JSON".to_string()))?;
    let kind = value
        .get("type")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string();

    serde_json::from_value(value).map_err(|e| match kind.as_str() {
        "conversation_started" | "chat_complete" | "token" | "model_complete" | "error" => {
            ProtocolError::Malformed(format!("Invalid {kind} event: {e}"))
        }
        _ => ProtocolError::UnknownType(kind),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_decode_chat_request() {
        let request = decode_request(
            r#"{"type":"chat","conversation_id":"c1","message":"hi","models":["m1"]}"#,
            DEFAULT_MAX_FRAME_SIZE,
        )
        .unwrap();
        assert_eq!(
            request,
            ClientRequest::chat(Some("c1".into()), "hi", vec!["m1".into()])
        );
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        assert_eq!(
            decode_request("{not json", DEFAULT_MAX_FRAME_SIZE).unwrap_err().to_string(),
            "Invalid JSON"
        );
        assert_eq!(
            decode_request(r#"{"type":"ping"}"#, DEFAULT_MAX_FRAME_SIZE).unwrap_err().to_string(),
            "Unknown message type: ping"
        );
        assert_eq!(
            decode_request(r#"{"message":"hi"}"#, DEFAULT_MAX_FRAME_SIZE).unwrap_err(),
            ProtocolError::UnknownType("None".into())
        );
        assert!(matches!(
            decode_request(r#"{"type":"chat","models":"m1"}"#, DEFAULT_MAX_FRAME_SIZE),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_enforces_size_limit() {
        let big = format!(r#"{{"type":"chat","message":"{}"}}"#, "x".repeat(64));
        assert_eq!(
            decode_request(&big, 32).unwrap_err(),
            ProtocolError::FrameTooLarge { size: big.len(), max: 32 }
        );
    }

    #[test]
    fn test_event_frames() {
        let frame = encode(&ServerEvent::Token {
            model_id: "m1".into(),
            token: "Hi".into(),
        })
        .unwrap();
        assert_eq!(frame, r#"{"type":"token","model_id":"m1","token":"Hi"}"#);
        assert!(matches!(decode_event(&frame).unwrap(), ServerEvent::Token { .. }));
        assert_eq!(
            decode_event(r#"{"type":"heartbeat"}"#).unwrap_err(),
            ProtocolError::UnknownType("heartbeat".into())
        );
    }
}
