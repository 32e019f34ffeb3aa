//! Model Registry
//!
//! Read-only reference data about the models the council can ask: which
//! provider serves each model, what it costs, what it can do, and whether
//! the credential for its provider is configured. The dispatcher never
//! mutates this data; it only reads descriptors to validate requests and to
//! price usage.

use std::cmp::Reverse;
use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::messages::ModelId;

/// Models offered per provider by [`ModelRegistry::featured_models`]
const FEATURED_PER_PROVIDER: usize = 3;

/// Registry construction errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// A model names a provider that was never declared
    #[error("model {model} references unknown provider {provider}")]
    UnknownProvider {
        /// Declaring model
        model: String,
        /// Missing provider key
        provider: String,
    },

    /// The same model id was declared twice
    #[error("duplicate model id: {0}")]
    DuplicateModel(String),

    /// The same provider id was declared twice
    #[error("duplicate provider id: {0}")]
    DuplicateProvider(String),
}

/// Static description of an upstream provider
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSpec {
    /// Provider key used in model declarations (`openai`, `groq`, ...)
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// OpenAI-compatible API root, without the `/chat/completions` suffix
    pub base_url: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    /// Short blurb for model pickers
    #[serde(default)]
    pub description: String,
}

impl ProviderSpec {
    fn builtin(id: &str, name: &str, base_url: &str, api_key_env: &str, description: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            base_url: base_url.to_string(),
            api_key_env: api_key_env.to_string(),
            description: description.to_string(),
        }
    }
}

/// Providers known out of the box
#[must_use]
pub fn builtin_providers() -> Vec<ProviderSpec> {
    vec![
        ProviderSpec::builtin(
            "openai",
            "OpenAI",
            "https://api.openai.com/v1",
            "OPENAI_API_KEY",
            "GPT-4o, o-series and other OpenAI models",
        ),
        ProviderSpec::builtin(
            "anthropic",
            "Anthropic",
            "https://api.anthropic.com/v1",
            "ANTHROPIC_API_KEY",
            "Claude models",
        ),
        ProviderSpec::builtin(
            "gemini",
            "Google Gemini",
            "https://generativelanguage.googleapis.com/v1beta/openai",
            "GEMINI_API_KEY",
            "Gemini Flash and Pro models",
        ),
        ProviderSpec::builtin("xai", "xAI", "https://api.x.ai/v1", "XAI_API_KEY", "Grok series models"),
        ProviderSpec::builtin(
            "mistral",
            "Mistral AI",
            "https://api.mistral.ai/v1",
            "MISTRAL_API_KEY",
            "Mistral and Mixtral models",
        ),
        ProviderSpec::builtin(
            "groq",
            "Groq",
            "https://api.groq.com/openai/v1",
            "GROQ_API_KEY",
            "Fast inference for Llama and Mixtral",
        ),
        ProviderSpec::builtin(
            "deepseek",
            "DeepSeek",
            "https://api.deepseek.com/v1",
            "DEEPSEEK_API_KEY",
            "DeepSeek chat and reasoning models",
        ),
        ProviderSpec::builtin(
            "together_ai",
            "Together AI",
            "https://api.together.xyz/v1",
            "TOGETHER_API_KEY",
            "Open models hosted on Together",
        ),
        ProviderSpec::builtin(
            "openrouter",
            "OpenRouter",
            "https://openrouter.ai/api/v1",
            "OPENROUTER_API_KEY",
            "Unified access to many hosted models",
        ),
    ]
}

/// A model as declared in configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSpec {
    /// Model id as sent by clients
    pub id: String,
    /// Provider key
    pub provider: String,
    /// Display name (generated from the id when absent)
    pub name: Option<String>,
    /// Short description
    pub description: String,
    /// USD per million prompt tokens
    pub input_cost_per_million: Option<f64>,
    /// USD per million completion tokens
    pub output_cost_per_million: Option<f64>,
    /// Maximum output tokens
    pub max_tokens: Option<u32>,
    /// Accepts image input
    pub supports_vision: bool,
    /// Supports function calling
    pub supports_tools: bool,
}

impl ModelSpec {
    /// Declare a model with no pricing or capability data
    pub fn new(id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            ..Default::default()
        }
    }

    /// Set pricing
    #[must_use]
    pub fn with_costs(mut self, input: f64, output: f64) -> Self {
        self.input_cost_per_million = Some(input);
        self.output_cost_per_million = Some(output);
        self
    }

    /// Set the description
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Models declared when the configuration file names none
#[must_use]
pub fn default_models() -> Vec<ModelSpec> {
    let mut gpt4o = ModelSpec::new("gpt-4o", "openai")
        .with_costs(2.5, 10.0)
        .with_description("Most capable GPT-4 model with vision. Great for complex tasks.");
    gpt4o.supports_vision = true;
    gpt4o.supports_tools = true;
    gpt4o.max_tokens = Some(16_384);

    let mut gpt4o_mini = ModelSpec::new("gpt-4o-mini", "openai")
        .with_costs(0.15, 0.6)
        .with_description("Fast and affordable GPT-4 variant for simpler tasks.");
    gpt4o_mini.supports_vision = true;
    gpt4o_mini.supports_tools = true;
    gpt4o_mini.max_tokens = Some(16_384);

    let mut sonnet = ModelSpec::new("claude-sonnet-4-20250514", "anthropic")
        .with_costs(3.0, 15.0)
        .with_description("Claude Sonnet 4, balanced performance and speed.");
    sonnet.supports_vision = true;
    sonnet.supports_tools = true;
    sonnet.max_tokens = Some(64_000);

    let mut haiku = ModelSpec::new("claude-3-5-haiku-20241022", "anthropic")
        .with_costs(0.8, 4.0)
        .with_description("Claude 3.5 Haiku, fast and affordable.");
    haiku.supports_tools = true;
    haiku.max_tokens = Some(8_192);

    let mut flash = ModelSpec::new("gemini/gemini-2.0-flash", "gemini")
        .with_costs(0.1, 0.4)
        .with_description("Gemini Flash, a fast multimodal model.");
    flash.supports_vision = true;
    flash.supports_tools = true;
    flash.max_tokens = Some(8_192);

    vec![
        gpt4o,
        gpt4o_mini,
        sonnet,
        haiku,
        flash,
        ModelSpec::new("xai/grok-3", "xai")
            .with_costs(3.0, 15.0)
            .with_description("Grok 3."),
        ModelSpec::new("mistral/mistral-large-latest", "mistral")
            .with_costs(2.0, 6.0)
            .with_description("Mistral's most capable model."),
        ModelSpec::new("groq/llama-3.3-70b-versatile", "groq")
            .with_costs(0.59, 0.79)
            .with_description("Llama 3.3 70B on Groq's fast inference."),
        ModelSpec::new("deepseek/deepseek-chat", "deepseek")
            .with_costs(0.27, 1.1)
            .with_description("DeepSeek's chat model."),
    ]
}

/// Per-million-token pricing of one model
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelCost {
    /// USD per million prompt tokens
    pub input_per_million: Option<f64>,
    /// USD per million completion tokens
    pub output_per_million: Option<f64>,
}

impl ModelCost {
    /// Estimated USD cost of one call; unknown prices count as free
    #[must_use]
    pub fn estimate(&self, tokens_input: u64, tokens_output: u64) -> f64 {
        let input = self.input_per_million.unwrap_or(0.0) * tokens_input as f64 / 1_000_000.0;
        let output = self.output_per_million.unwrap_or(0.0) * tokens_output as f64 / 1_000_000.0;
        input + output
    }
}

/// Model reference data handed to the dispatcher and to clients
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Model identifier
    pub id: ModelId,
    /// Display name
    pub name: String,
    /// Provider key
    pub provider: String,
    /// Short description
    pub description: String,
    /// USD per million prompt tokens
    pub input_cost_per_million: Option<f64>,
    /// USD per million completion tokens
    pub output_cost_per_million: Option<f64>,
    /// Maximum output tokens
    pub max_tokens: Option<u32>,
    /// Accepts image input
    pub supports_vision: bool,
    /// Supports function calling
    pub supports_tools: bool,
    /// Streams fragments (always true for council models)
    pub supports_streaming: bool,
    /// Whether the provider credential is configured
    pub has_api_key: bool,
}

impl ModelDescriptor {
    /// Build a descriptor from a declaration
    #[must_use]
    pub fn from_spec(spec: &ModelSpec, has_api_key: bool) -> Self {
        Self {
            id: ModelId::new(spec.id.clone()),
            name: spec
                .name
                .clone()
                .unwrap_or_else(|| generate_model_name(&spec.id)),
            provider: spec.provider.clone(),
            description: spec.description.clone(),
            input_cost_per_million: spec.input_cost_per_million,
            output_cost_per_million: spec.output_cost_per_million,
            max_tokens: spec.max_tokens,
            supports_vision: spec.supports_vision,
            supports_tools: spec.supports_tools,
            supports_streaming: true,
            has_api_key,
        }
    }

    /// Pricing of this model
    #[must_use]
    pub fn cost(&self) -> ModelCost {
        ModelCost {
            input_per_million: self.input_cost_per_million,
            output_per_million: self.output_cost_per_million,
        }
    }

    /// Model name as the provider's API expects it (`groq/llama-3` -> `llama-3`)
    #[must_use]
    pub fn upstream_name(&self) -> &str {
        let id = self.id.as_str();
        id.strip_prefix(self.provider.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(id)
    }
}

/// A provider together with its resolved credential
#[derive(Clone)]
pub struct Provider {
    /// Static description
    pub spec: ProviderSpec,
    api_key: Option<String>,
}

impl Provider {
    /// Resolve the credential from the provider's environment variable
    #[must_use]
    pub fn from_env(spec: ProviderSpec) -> Self {
        let api_key = std::env::var(&spec.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty());
        Self { spec, api_key }
    }

    /// Use an explicit credential
    #[must_use]
    pub fn with_key(spec: ProviderSpec, api_key: Option<String>) -> Self {
        let api_key = api_key.filter(|key| !key.trim().is_empty());
        Self { spec, api_key }
    }

    /// Whether a credential is configured
    #[must_use]
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// The credential, if configured
    #[must_use]
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("spec", &self.spec)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Models grouped under their provider
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderGroup {
    /// Provider key
    pub id: String,
    /// Provider display name
    pub name: String,
    /// Whether the provider credential is configured
    pub has_api_key: bool,
    /// Models, newest first
    pub models: Vec<ModelDescriptor>,
}

/// The set of models the council can dispatch to
#[derive(Clone, Debug)]
pub struct ModelRegistry {
    providers: Vec<Provider>,
    models: Vec<ModelDescriptor>,
}

impl ModelRegistry {
    /// Build a registry, rejecting dangling provider references and duplicates
    pub fn new(providers: Vec<Provider>, models: &[ModelSpec]) -> Result<Self, RegistryError> {
        let mut seen = HashSet::new();
        for provider in &providers {
            if !seen.insert(provider.spec.id.as_str()) {
                return Err(RegistryError::DuplicateProvider(provider.spec.id.clone()));
            }
        }

        let mut descriptors = Vec::with_capacity(models.len());
        let mut ids = HashSet::new();
        for spec in models {
            let provider = providers
                .iter()
                .find(|p| p.spec.id == spec.provider)
                .ok_or_else(|| RegistryError::UnknownProvider {
                    model: spec.id.clone(),
                    provider: spec.provider.clone(),
                })?;
            if !ids.insert(spec.id.as_str()) {
                return Err(RegistryError::DuplicateModel(spec.id.clone()));
            }
            descriptors.push(ModelDescriptor::from_spec(spec, provider.has_api_key()));
        }

        Ok(Self {
            providers,
            models: descriptors,
        })
    }

    /// Built-in providers and models, credentials read from the environment
    pub fn from_env() -> Result<Self, RegistryError> {
        let providers = builtin_providers().into_iter().map(Provider::from_env).collect();
        Self::new(providers, &default_models())
    }

    /// Every declared model, credentialed or not, in declaration order
    #[must_use]
    pub fn list_models(&self) -> &[ModelDescriptor] {
        &self.models
    }

    /// Models whose provider credential is configured
    #[must_use]
    pub fn available_models(&self) -> Vec<ModelDescriptor> {
        self.models.iter().filter(|m| m.has_api_key).cloned().collect()
    }

    /// Models grouped by provider, each group sorted newest first.
    ///
    /// Providers without models are omitted.
    #[must_use]
    pub fn providers(&self) -> Vec<ProviderGroup> {
        self.providers
            .iter()
            .filter_map(|provider| {
                let mut models: Vec<ModelDescriptor> = self
                    .models
                    .iter()
                    .filter(|m| m.provider == provider.spec.id)
                    .cloned()
                    .collect();
                if models.is_empty() {
                    return None;
                }
                models.sort_by_cached_key(|m| model_sort_key(m.id.as_str()));
                Some(ProviderGroup {
                    id: provider.spec.id.clone(),
                    name: provider.spec.name.clone(),
                    has_api_key: provider.has_api_key(),
                    models,
                })
            })
            .collect()
    }

    /// The newest few available models of every credentialed provider
    #[must_use]
    pub fn featured_models(&self) -> Vec<ModelDescriptor> {
        self.providers()
            .into_iter()
            .filter(|group| group.has_api_key)
            .flat_map(|group| group.models.into_iter().take(FEATURED_PER_PROVIDER))
            .collect()
    }

    /// Look up one model
    #[must_use]
    pub fn descriptor(&self, id: &ModelId) -> Option<&ModelDescriptor> {
        self.models.iter().find(|m| &m.id == id)
    }

    /// Display name of a model, falling back to the raw id
    #[must_use]
    pub fn display_name(&self, id: &ModelId) -> String {
        self.descriptor(id)
            .map_or_else(|| id.as_str().to_string(), |m| m.name.clone())
    }

    /// Pricing of a model
    #[must_use]
    pub fn cost(&self, id: &ModelId) -> Option<ModelCost> {
        self.descriptor(id).map(ModelDescriptor::cost)
    }

    /// The provider serving a model
    #[must_use]
    pub fn provider_for(&self, id: &ModelId) -> Option<&Provider> {
        let descriptor = self.descriptor(id)?;
        self.providers.iter().find(|p| p.spec.id == descriptor.provider)
    }
}

/// Human-readable name generated from a model id.
///
/// `gpt-4o-mini` becomes `GPT-4o Mini`, `claude-3-5-haiku-20241022` becomes
/// `Claude 3 5 Haiku`.
#[must_use]
pub fn generate_model_name(model_id: &str) -> String {
    let base = base_name(model_id);
    let base = strip_date_suffix(base);

    let title_cased: Vec<String> = base
        .split(|c| c == '-' || c == '_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect();
    let mut name = title_cased.join(" ");

    // Longest patterns first so `Gpt 4o` is not pre-empted by `Gpt`
    for (from, to) in [("Gpt 4o", "GPT-4o"), ("Gpt 4", "GPT-4"), ("Gpt 3", "GPT-3"), ("Gpt", "GPT")] {
        name = name.replace(from, to);
    }
    name
}

fn base_name(model_id: &str) -> &str {
    model_id.rsplit('/').next().unwrap_or(model_id)
}

fn strip_date_suffix(name: &str) -> &str {
    let bytes = name.as_bytes();
    if bytes.len() > 9 {
        let (head, date) = bytes.split_at(bytes.len() - 8);
        if date.iter().all(u8::is_ascii_digit) && head.last() == Some(&b'-') {
            return &name[..head.len() - 1];
        }
    }
    name
}

type SortKey = (Reverse<u64>, Reverse<u64>, Reverse<u64>, String);

/// Ordering key placing newer models first: trailing `YYYYMMDD` date, then
/// major/minor version, then name.
fn model_sort_key(model_id: &str) -> SortKey {
    let base = base_name(model_id).to_lowercase();
    let bytes = base.as_bytes();

    let date = trailing_digits(bytes)
        .filter(|digits| digits.len() >= 8)
        .map_or(0, |digits| parse_digits(&digits[digits.len() - 8..]));

    let (major, minor) = version_of(bytes);
    (Reverse(date), Reverse(major), Reverse(minor), base)
}

fn version_of(bytes: &[u8]) -> (u64, u64) {
    let is_sep = |b: u8| b == b'-' || b == b' ';

    // `-3-5`, `-2.0`
    for start in 0..bytes.len() {
        if !is_sep(bytes[start]) {
            continue;
        }
        let major = digit_run(&bytes[start + 1..]);
        if major.is_empty() {
            continue;
        }
        let after = start + 1 + major.len();
        if after < bytes.len() && (is_sep(bytes[after]) || bytes[after] == b'.') {
            let minor = digit_run(&bytes[after + 1..]);
            if !minor.is_empty() {
                return (parse_digits(major), parse_digits(minor));
            }
        }
    }

    // `-4`, `-4-turbo`
    for start in 0..bytes.len() {
        if !is_sep(bytes[start]) {
            continue;
        }
        let major = digit_run(&bytes[start + 1..]);
        if major.is_empty() {
            continue;
        }
        let after = start + 1 + major.len();
        if after == bytes.len() || is_sep(bytes[after]) {
            return (parse_digits(major), 0);
        }
    }

    // `o1`, `o3-mini`
    if let Some(rest) = bytes.strip_prefix(b"o") {
        let major = digit_run(rest);
        if !major.is_empty() {
            return (parse_digits(major), 0);
        }
    }

    trailing_digits(bytes).map_or((0, 0), |digits| (parse_digits(digits), 0))
}

fn digit_run(bytes: &[u8]) -> &[u8] {
    let len = bytes.iter().take_while(|b| b.is_ascii_digit()).count();
    &bytes[..len]
}

fn trailing_digits(bytes: &[u8]) -> Option<&[u8]> {
    let len = bytes.iter().rev().take_while(|b| b.is_ascii_digit()).count();
    (len > 0).then(|| &bytes[bytes.len() - len..])
}

fn parse_digits(digits: &[u8]) -> u64 {
    digits
        .iter()
        .fold(0u64, |acc, d| acc.saturating_mul(10).saturating_add(u64::from(d - b'0')))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn provider(id: &str, key: Option<&str>) -> Provider {
        let spec = ProviderSpec::builtin(id, &id.to_uppercase(), "http://localhost", "UNUSED", "");
        Provider::with_key(spec, key.map(String::from))
    }

    fn registry() -> ModelRegistry {
        ModelRegistry::new(
            vec![provider("openai", Some("sk-test")), provider("anthropic", None)],
            &[
                ModelSpec::new("gpt-4o-mini", "openai"),
                ModelSpec::new("gpt-4", "openai"),
                ModelSpec::new("o1", "openai"),
                ModelSpec::new("gpt-4o", "openai").with_costs(2.5, 10.0),
                ModelSpec::new("claude-3-5-sonnet-20241022", "anthropic"),
                ModelSpec::new("claude-sonnet-4-20250514", "anthropic"),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_generate_model_name() {
        assert_eq!(generate_model_name("gpt-4o-mini"), "GPT-4o Mini");
        assert_eq!(generate_model_name("gpt-4-turbo"), "GPT-4 Turbo");
        assert_eq!(generate_model_name("claude-3-5-haiku-20241022"), "Claude 3 5 Haiku");
        assert_eq!(generate_model_name("groq/llama-3.3-70b-versatile"), "Llama 3.3 70b Versatile");
        assert_eq!(generate_model_name("deepseek/deepseek_chat"), "Deepseek Chat");
    }

    #[test]
    fn test_sort_key_prefers_newer() {
        let mut ids = vec![
            "claude-3-5-sonnet-20241022",
            "claude-3-opus-20240229",
            "claude-sonnet-4-20250514",
        ];
        ids.sort_by_key(|id| model_sort_key(id));
        assert_eq!(
            ids,
            vec!["claude-sonnet-4-20250514", "claude-3-5-sonnet-20241022", "claude-3-opus-20240229"]
        );

        let mut ids = vec!["gpt-3.5-turbo", "o1", "gpt-4", "o3-mini"];
        ids.sort_by_key(|id| model_sort_key(id));
        assert_eq!(ids, vec!["gpt-4", "gpt-3.5-turbo", "o3-mini", "o1"]);
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let err = ModelRegistry::new(vec![provider("openai", None)], &[ModelSpec::new("m", "nope")]).unwrap_err();
        assert_eq!(
            err,
            RegistryError::UnknownProvider {
                model: "m".into(),
                provider: "nope".into()
            }
        );
    }

    #[test]
    fn test_duplicate_model_rejected() {
        let err = ModelRegistry::new(
            vec![provider("openai", None)],
            &[ModelSpec::new("m", "openai"), ModelSpec::new("m", "openai")],
        )
        .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateModel("m".into()));
    }

    #[test]
    fn test_available_models_requires_credentials() {
        let registry = registry();
        assert_eq!(registry.list_models().len(), 6);
        let available: Vec<_> = registry.available_models().into_iter().map(|m| m.id.0).collect();
        assert_eq!(available, vec!["gpt-4o-mini", "gpt-4", "o1", "gpt-4o"]);
    }

    #[test]
    fn test_providers_grouped_and_featured() {
        let registry = registry();
        let groups = registry.providers();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[1].models[0].id.as_str(), "claude-sonnet-4-20250514");
        assert!(!groups[1].has_api_key);

        let featured = registry.featured_models();
        assert_eq!(featured.len(), 3);
        assert!(featured.iter().all(|m| m.provider == "openai"));
    }

    #[test]
    fn test_display_name_and_cost() {
        let registry = registry();
        assert_eq!(registry.display_name(&"gpt-4o".into()), "GPT-4o");
        assert_eq!(registry.display_name(&"missing".into()), "missing");

        let cost = registry.cost(&"gpt-4o".into()).unwrap();
        let estimate = cost.estimate(1_000_000, 100_000);
        assert!((estimate - 3.5).abs() < 1e-9);
        assert_eq!(registry.cost(&"o1".into()).unwrap().estimate(10, 10), 0.0);
    }

    #[test]
    fn test_upstream_name_strips_provider_prefix() {
        let spec = ModelSpec::new("groq/llama-3.3-70b-versatile", "groq");
        let descriptor = ModelDescriptor::from_spec(&spec, true);
        assert_eq!(descriptor.upstream_name(), "llama-3.3-70b-versatile");

        let spec = ModelSpec::new("openrouter/anthropic/claude-3.5-sonnet", "openrouter");
        let descriptor = ModelDescriptor::from_spec(&spec, true);
        assert_eq!(descriptor.upstream_name(), "anthropic/claude-3.5-sonnet");
    }

    #[test]
    fn test_provider_debug_redacts_key() {
        let rendered = format!("{:?}", provider("openai", Some("sk-secret")));
        assert!(!rendered.contains("sk-secret"));
    }
}
