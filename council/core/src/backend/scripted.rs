//! Scripted Backend
//!
//! Deterministic models that replay a fixed script of fragments with fixed
//! delays. Used by the daemon's `--offline` mode and by tests that need to
//! control exactly when each model speaks, fails, or goes silent.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::traits::{CompletionRequest, CompletionSummary, ModelProvider, StreamingToken};
use crate::messages::ModelId;
use crate::registry::{ModelDescriptor, ModelSpec};

/// One step of a scripted stream
#[derive(Clone, Debug, PartialEq)]
pub enum ScriptStep {
    /// Wait before the next step
    Sleep(Duration),
    /// Emit a fragment
    Token(String),
    /// Finish successfully
    Complete(CompletionSummary),
    /// Finish with an error
    Fail(String),
    /// Keep the stream open forever without emitting anything
    Hang,
}

/// A model and its script
#[derive(Clone, Debug)]
pub struct ScriptedModel {
    /// Descriptor reported by `list_models`
    pub descriptor: ModelDescriptor,
    /// Steps replayed on every request
    pub steps: Vec<ScriptStep>,
    /// Refuse to start the stream at all
    pub start_error: Option<String>,
}

impl ScriptedModel {
    /// A credentialed model with an empty script
    pub fn new(id: impl Into<String>) -> Self {
        let spec = ModelSpec::new(id, "scripted");
        Self {
            descriptor: ModelDescriptor::from_spec(&spec, true),
            steps: Vec::new(),
            start_error: None,
        }
    }

    /// Model that streams `fragments` and then completes
    pub fn replying<I, S>(id: impl Into<String>, fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut model = Self::new(id);
        let mut count = 0u32;
        for fragment in fragments {
            model.steps.push(ScriptStep::Token(fragment.into()));
            count += 1;
        }
        model.steps.push(ScriptStep::Complete(CompletionSummary {
            tokens_input: Some(10),
            tokens_output: Some(count),
            latency_ms: None,
        }));
        model
    }

    /// Model that never answers
    pub fn silent(id: impl Into<String>) -> Self {
        Self::new(id).then(ScriptStep::Hang)
    }

    /// Model whose stream cannot be opened
    pub fn unreachable(id: impl Into<String>, error: impl Into<String>) -> Self {
        let mut model = Self::new(id);
        model.start_error = Some(error.into());
        model
    }

    /// Append a step
    #[must_use]
    pub fn then(mut self, step: ScriptStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Insert a delay before every fragment
    #[must_use]
    pub fn with_fragment_delay(mut self, delay: Duration) -> Self {
        self.steps = self
            .steps
            .into_iter()
            .flat_map(|step| match step {
                ScriptStep::Token(_) => vec![ScriptStep::Sleep(delay), step],
                other => vec![other],
            })
            .collect();
        self
    }

    /// Mark the model as lacking credentials
    #[must_use]
    pub fn without_credentials(mut self) -> Self {
        self.descriptor.has_api_key = false;
        self
    }

    /// Override the display name
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.descriptor.name = name.into();
        self
    }
}

/// Provider serving scripted models
#[derive(Clone, Debug, Default)]
pub struct ScriptedBackend {
    order: Vec<ModelId>,
    models: HashMap<ModelId, ScriptedModel>,
}

impl ScriptedBackend {
    /// Create an empty backend
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model (replacing any previous script for the same id)
    #[must_use]
    pub fn with_model(mut self, model: ScriptedModel) -> Self {
        let id = model.descriptor.id.clone();
        if self.models.insert(id.clone(), model).is_none() {
            self.order.push(id);
        }
        self
    }

    /// A small council of canned models for offline demos
    #[must_use]
    pub fn demo() -> Self {
        let delay = Duration::from_millis(40);
        Self::new()
            .with_model(
                ScriptedModel::replying("echo-fast", ["Hello", " from", " the", " fast", " model."])
                    .named("Echo Fast")
                    .with_fragment_delay(delay),
            )
            .with_model(
                ScriptedModel::replying(
                    "echo-slow",
                    ["Taking", " my", " time", " but", " getting", " there."],
                )
                .named("Echo Slow")
                .with_fragment_delay(delay * 4),
            )
            .with_model(
                ScriptedModel::new("echo-flaky")
                    .named("Echo Flaky")
                    .then(ScriptStep::Sleep(delay))
                    .then(ScriptStep::Token("I was about to say".into()))
                    .then(ScriptStep::Sleep(delay))
                    .then(ScriptStep::Fail("upstream connection reset".into())),
            )
    }
}

#[async_trait]
impl ModelProvider for ScriptedBackend {
    fn name(&self) -> &str {
        "Scripted"
    }

    async fn list_models(&self) -> anyhow::Result<Vec<ModelDescriptor>> {
        Ok(self
            .order
            .iter()
            .filter_map(|id| self.models.get(id))
            .map(|m| m.descriptor.clone())
            .collect())
    }

    async fn stream_completion(
        &self,
        request: &CompletionRequest,
    ) -> anyhow::Result<mpsc::Receiver<StreamingToken>> {
        let model = self
            .models
            .get(&request.model)
            .ok_or_else(|| anyhow::anyhow!("unknown model {}", request.model))?;
        if let Some(error) = &model.start_error {
            anyhow::bail!("{error}");
        }

        let steps = model.steps.clone();
        let (tx, rx) = mpsc::channel(steps.len().max(1));

        tokio::spawn(async move {
            for step in steps {
                let token = match step {
                    ScriptStep::Sleep(delay) => {
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    ScriptStep::Hang => {
                        // Hold the sender so the receiver never sees a close
                        std::future::pending::<()>().await;
                        return;
                    }
                    ScriptStep::Token(text) => StreamingToken::Token(text),
                    ScriptStep::Complete(summary) => StreamingToken::Complete(summary),
                    ScriptStep::Fail(error) => StreamingToken::Error(error),
                };
                let terminal = token.is_terminal();
                if tx.send(token).await.is_err() || terminal {
                    return;
                }
            }
            // Script ran out without a terminal step: dropping tx closes the stream
        });

        Ok(rx)
    }
}
