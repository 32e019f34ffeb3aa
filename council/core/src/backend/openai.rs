//! OpenAI-compatible Backend
//!
//! Streams completions from any provider exposing the OpenAI
//! `/chat/completions` API with `stream: true`. The response body is a
//! server-sent event stream:
//!
//! ```text
//! data: {"choices":[{"delta":{"content":"Hi"}}]}
//!
//! data: {"choices":[],"usage":{"prompt_tokens":9,"completion_tokens":2}}
//!
//! data: [DONE]
//! ```
//!
//! Which provider (base URL and API key) serves a model comes from the
//! [`ModelRegistry`].

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::traits::{CompletionRequest, CompletionSummary, ModelProvider, StreamingToken};
use crate::registry::{ModelDescriptor, ModelRegistry};

/// Buffered fragments per in-flight stream
const STREAM_CHANNEL_CAPACITY: usize = 100;

/// One decoded server-sent event
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SseEvent {
    /// A content fragment
    Delta(String),
    /// Usage figures (sent once, usually just before `[DONE]`)
    Usage {
        /// Tokens in the prompt
        prompt_tokens: Option<u32>,
        /// Tokens generated
        completion_tokens: Option<u32>,
    },
    /// The provider reported an error inside the stream
    Error(String),
    /// End of stream marker
    Done,
}

/// Decode the `data` payload of one server-sent event
pub fn parse_event_data(data: &str) -> Vec<SseEvent> {
    let data = data.trim();
    if data.is_empty() {
        return Vec::new();
    }
    if data == "[DONE]" {
        return vec![SseEvent::Done];
    }

    let Ok(value) = serde_json::from_str::<Value>(data) else {
        trace!(line = data, "Skipping undecodable SSE payload");
        return Vec::new();
    };

    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| error.to_string(), String::from);
        return vec![SseEvent::Error(message)];
    }

    let mut events = Vec::new();
    if let Some(choices) = value.get("choices").and_then(Value::as_array) {
        for choice in choices {
            if let Some(content) = choice
                .get("delta")
                .and_then(|d| d.get("content"))
                .and_then(Value::as_str)
            {
                if !content.is_empty() {
                    events.push(SseEvent::Delta(content.to_string()));
                }
            }
        }
    }

    if let Some(usage) = value.get("usage").filter(|u| u.is_object()) {
        let count = |key: &str| {
            usage
                .get(key)
                .and_then(Value::as_u64)
                .and_then(|n| u32::try_from(n).ok())
        };
        events.push(SseEvent::Usage {
            prompt_tokens: count("prompt_tokens"),
            completion_tokens: count("completion_tokens"),
        });
    }
    events
}

/// Streaming client for OpenAI-compatible providers
#[derive(Clone)]
pub struct OpenAiCompatibleBackend {
    registry: Arc<ModelRegistry>,
    http_client: reqwest::Client,
}

impl OpenAiCompatibleBackend {
    /// Create a backend serving every model in the registry
    pub fn new(registry: Arc<ModelRegistry>) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            registry,
            http_client,
        })
    }

    /// The registry this backend resolves models against
    #[must_use]
    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    fn request_body(descriptor: &ModelDescriptor, request: &CompletionRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| serde_json::json!({ "role": m.role.as_str(), "content": m.content }))
            .collect();

        let mut body = serde_json::json!({
            "model": descriptor.upstream_name(),
            "messages": messages,
            "temperature": request.temperature,
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if request.max_tokens > 0 {
            body["max_tokens"] = serde_json::json!(request.max_tokens);
        }
        body
    }
}

#[async_trait]
impl ModelProvider for OpenAiCompatibleBackend {
    fn name(&self) -> &str {
        "OpenAI-compatible"
    }

    async fn list_models(&self) -> anyhow::Result<Vec<ModelDescriptor>> {
        Ok(self.registry.list_models().to_vec())
    }

    async fn stream_completion(
        &self,
        request: &CompletionRequest,
    ) -> anyhow::Result<mpsc::Receiver<StreamingToken>> {
        let descriptor = self
            .registry
            .descriptor(&request.model)
            .ok_or_else(|| anyhow::anyhow!("unknown model {}", request.model))?;
        let provider = self
            .registry
            .provider_for(&request.model)
            .ok_or_else(|| anyhow::anyhow!("no provider for model {}", request.model))?;
        let api_key = provider
            .api_key()
            .ok_or_else(|| anyhow::anyhow!("{} is not set", provider.spec.api_key_env))?;

        let url = format!("{}/chat/completions", provider.spec.base_url.trim_end_matches('/'));
        let body = Self::request_body(descriptor, request);

        debug!(model = %request.model, url = %url, messages = request.messages.len(), "Starting upstream stream");
        let start = Instant::now();

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("{} returned {status}: {body}", provider.spec.name);
        }

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(pump_events(response.bytes_stream(), tx, start));

        Ok(rx)
    }
}

/// Decode an SSE body and forward its fragments until a terminal event
///
/// Event framing and UTF-8 decoding happen on the whole byte stream, so a
/// character split across network chunks arrives intact.
async fn pump_events<S, B, E>(body: S, tx: mpsc::Sender<StreamingToken>, start: Instant)
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: fmt::Display,
{
    let mut events = std::pin::pin!(body.eventsource());
    let mut summary = CompletionSummary::default();

    while let Some(event) = events.next().await {
        match event {
            Ok(event) => {
                if forward(parse_event_data(&event.data), &tx, &mut summary, start).await {
                    return;
                }
            }
            Err(e) => {
                let _ = tx.send(StreamingToken::Error(format!("SSE stream error: {e}"))).await;
                return;
            }
        }
    }

    // Body ended without [DONE]
    let _ = tx
        .send(StreamingToken::Error("Stream ended before completion".to_string()))
        .await;
}

/// Forward decoded events downstream. Returns true once the stream is over
/// (terminal event sent or receiver gone).
async fn forward(
    events: Vec<SseEvent>,
    tx: &mpsc::Sender<StreamingToken>,
    summary: &mut CompletionSummary,
    start: Instant,
) -> bool {
    for event in events {
        match event {
            SseEvent::Delta(text) => {
                if tx.send(StreamingToken::Token(text)).await.is_err() {
                    // Receiver dropped, stop streaming
                    return true;
                }
            }
            SseEvent::Usage {
                prompt_tokens,
                completion_tokens,
            } => {
                summary.tokens_input = prompt_tokens;
                summary.tokens_output = completion_tokens;
            }
            SseEvent::Error(message) => {
                let _ = tx.send(StreamingToken::Error(message)).await;
                return true;
            }
            SseEvent::Done => {
                summary.latency_ms = Some(elapsed_ms(start));
                let _ = tx.send(StreamingToken::Complete(summary.clone())).await;
                return true;
            }
        }
    }
    false
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ChatMessage;
    use crate::registry::{ModelSpec, Provider, ProviderSpec};
    use pretty_assertions::assert_eq;

    async fn collect(chunks: Vec<Vec<u8>>) -> Vec<StreamingToken> {
        let body = futures::stream::iter(chunks.into_iter().map(Ok::<_, std::io::Error>));
        let (tx, mut rx) = mpsc::channel(16);
        pump_events(body, tx, Instant::now()).await;
        let mut tokens = Vec::new();
        while let Some(token) = rx.recv().await {
            tokens.push(token);
        }
        tokens
    }

    #[tokio::test]
    async fn test_events_split_across_chunks() {
        let tokens = collect(vec![
            b"data: {\"choices\":[{\"delta\":{\"con".to_vec(),
            b"tent\":\"Hi\"}}]}\n\ndata: [DONE]\n\n".to_vec(),
        ])
        .await;
        assert_eq!(tokens[0], StreamingToken::Token("Hi".into()));
        assert!(matches!(tokens[1], StreamingToken::Complete(_)));
        assert_eq!(tokens.len(), 2);
    }

    #[tokio::test]
    async fn test_multibyte_character_split_across_chunks() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"h\u{e9}llo\"}}]}\n\n".as_bytes();
        // Cut between the two bytes of the accented e
        let split = line.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let (head, tail) = line.split_at(split);

        let tokens = collect(vec![head.to_vec(), tail.to_vec(), b"data: [DONE]\n\n".to_vec()]).await;
        assert_eq!(tokens[0], StreamingToken::Token("h\u{e9}llo".into()));
    }

    #[tokio::test]
    async fn test_body_without_done_is_an_error() {
        let tokens = collect(vec![b"data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\n".to_vec()]).await;
        assert_eq!(
            tokens,
            vec![
                StreamingToken::Token("x".into()),
                StreamingToken::Error("Stream ended before completion".into()),
            ]
        );
    }

    #[test]
    fn test_parse_usage_payload() {
        let events = parse_event_data("{\"choices\":[],\"usage\":{\"prompt_tokens\":9,\"completion_tokens\":2}}");
        assert_eq!(
            events,
            vec![SseEvent::Usage {
                prompt_tokens: Some(9),
                completion_tokens: Some(2)
            }]
        );
        assert!(parse_event_data("not json").is_empty());
    }

    #[test]
    fn test_parse_stream_error_payload() {
        assert_eq!(
            parse_event_data("{\"error\":{\"message\":\"rate limited\"}}"),
            vec![SseEvent::Error("rate limited".into())]
        );
    }

    #[test]
    fn test_request_body() {
        let spec = ModelSpec::new("groq/llama-3.3-70b-versatile", "groq");
        let descriptor = ModelDescriptor::from_spec(&spec, true);
        let request = CompletionRequest::new(
            "groq/llama-3.3-70b-versatile",
            vec![ChatMessage::user("Hello")],
        )
        .with_max_tokens(64);

        let body = OpenAiCompatibleBackend::request_body(&descriptor, &request);
        assert_eq!(body["model"], "llama-3.3-70b-versatile");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_tokens"], 64);
    }

    #[tokio::test]
    async fn test_missing_credential_is_an_error() {
        let spec = ProviderSpec {
            id: "openai".into(),
            name: "OpenAI".into(),
            base_url: "http://127.0.0.1:9".into(),
            api_key_env: "COUNCIL_TEST_UNSET_KEY".into(),
            description: String::new(),
        };
        let registry = ModelRegistry::new(
            vec![Provider::with_key(spec, None)],
            &[ModelSpec::new("gpt-4o", "openai")],
        )
        .unwrap();
        let backend = OpenAiCompatibleBackend::new(Arc::new(registry)).unwrap();

        let request = CompletionRequest::new("gpt-4o", vec![ChatMessage::user("hi")]);
        let err = backend.stream_completion(&request).await.unwrap_err();
        assert!(err.to_string().contains("COUNCIL_TEST_UNSET_KEY"));
    }
}
