//! TOML Configuration File Support
//!
//! Loads `~/.config/llm-council/council.toml`.
//!
//! # Configuration Priority
//!
//! Highest first:
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! bind_address = "127.0.0.1:8000"
//! max_connections = 100
//! outbound_capacity = 256
//! max_message_size = 1048576
//!
//! [dispatch]
//! upstream_timeout_secs = 120
//! max_context_messages = 50
//! temperature = 0.7
//! max_tokens = 0
//!
//! [client]
//! url = "ws://127.0.0.1:8000/chat/ws"
//! reconnect_delay_ms = 3000
//!
//! [providers.local]
//! name = "Local vLLM"
//! base_url = "http://127.0.0.1:8080/v1"
//! api_key_env = "LOCAL_API_KEY"
//!
//! [[models]]
//! id = "local/qwen2.5-7b-instruct"
//! provider = "local"
//! input_cost_per_million = 0.0
//! output_cost_per_million = 0.0
//! ```
//!
//! Providers merge onto the built-in table by key. Declaring any `[[models]]`
//! replaces the default model list.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dispatcher::DispatchConfig;
use crate::registry::{builtin_providers, default_models, ModelRegistry, ModelSpec, Provider, ProviderSpec};
use crate::transport::DEFAULT_MAX_FRAME_SIZE;

/// Bind address override
pub const ENV_BIND: &str = "COUNCIL_BIND";
/// Per-model deadline override, in seconds
pub const ENV_UPSTREAM_TIMEOUT_SECS: &str = "COUNCIL_UPSTREAM_TIMEOUT_SECS";
/// Client URL override
pub const ENV_URL: &str = "COUNCIL_URL";
/// Reconnect delay override, in milliseconds
pub const ENV_RECONNECT_DELAY_MS: &str = "COUNCIL_RECONNECT_DELAY_MS";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    Read {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Default value
    Default,
    /// Value from TOML configuration file
    File,
    /// Value from environment variable
    Env,
    /// Value from command-line argument
    Cli,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[server]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// Listen address
    pub bind_address: Option<String>,
    /// Concurrent connection limit
    pub max_connections: Option<usize>,
    /// Per-session event queue depth
    pub outbound_capacity: Option<usize>,
    /// Inbound frame limit in bytes
    pub max_message_size: Option<usize>,
}

/// `[dispatch]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchToml {
    /// Per-model deadline
    pub upstream_timeout_secs: Option<u64>,
    /// Prior messages sent upstream
    pub max_context_messages: Option<usize>,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Output token cap (0 = provider default)
    pub max_tokens: Option<u32>,
}

/// `[client]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientToml {
    /// Server endpoint
    pub url: Option<String>,
    /// Wait before reconnecting
    pub reconnect_delay_ms: Option<u64>,
}

/// `[providers.<key>]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderToml {
    /// Display name
    pub name: Option<String>,
    /// OpenAI-compatible API root
    pub base_url: Option<String>,
    /// Environment variable holding the key
    pub api_key_env: Option<String>,
    /// Short description
    pub description: Option<String>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CouncilToml {
    /// `[server]`
    pub server: ServerToml,
    /// `[dispatch]`
    pub dispatch: DispatchToml,
    /// `[client]`
    pub client: ClientToml,
    /// `[providers.*]`
    pub providers: BTreeMap<String, ProviderToml>,
    /// `[[models]]`
    pub models: Vec<ModelSpec>,
}

// =============================================================================
// Resolved Configuration
// =============================================================================

/// WebSocket server settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// Listen address
    pub bind_address: String,
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Depth of each session's outbound event queue
    pub outbound_capacity: usize,
    /// Inbound frame limit in bytes
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8000".to_string(),
            max_connections: 100,
            outbound_capacity: 256,
            max_message_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Duplex channel client settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    /// Server endpoint
    pub url: String,
    /// Wait between entering `Disconnected` and the next attempt
    pub reconnect_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8000/chat/ws".to_string(),
            reconnect_delay: Duration::from_millis(3000),
        }
    }
}

/// Fully resolved configuration
#[derive(Clone, Debug)]
pub struct CouncilConfig {
    /// WebSocket server settings
    pub server: ServerConfig,
    /// Turn dispatch settings
    pub dispatch: DispatchConfig,
    /// Duplex channel client settings
    pub client: ClientConfig,
    /// Provider table (built-ins merged with file entries)
    pub providers: Vec<ProviderSpec>,
    /// Declared models
    pub models: Vec<ModelSpec>,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    sources: BTreeMap<&'static str, ConfigSource>,
}

impl Default for CouncilConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            dispatch: DispatchConfig::default(),
            client: ClientConfig::default(),
            providers: builtin_providers(),
            models: default_models(),
            config_file_path: None,
            sources: BTreeMap::new(),
        }
    }
}

impl CouncilConfig {
    /// Create a configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Where a setting came from, keyed as `section.field`
    #[must_use]
    pub fn source_of(&self, key: &str) -> ConfigSource {
        self.sources.get(key).copied().unwrap_or(ConfigSource::Default)
    }

    /// Highest-priority source that contributed any value
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.sources.values().copied().max().unwrap_or(ConfigSource::Default)
    }

    fn set_source(&mut self, key: &'static str, source: ConfigSource) {
        self.sources.insert(key, source);
    }

    /// Check values that would make the daemon misbehave
    ///
    /// # Errors
    ///
    /// Returns `Validation` for a zero timeout or capacity, a model naming an
    /// undefined provider, or duplicate model ids.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatch.upstream_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "dispatch.upstream_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.server.outbound_capacity == 0 {
            return Err(ConfigError::Validation(
                "server.outbound_capacity must be greater than zero".into(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(ConfigError::Validation(
                "server.max_connections must be greater than zero".into(),
            ));
        }
        for provider in &self.providers {
            if provider.base_url.is_empty() || provider.api_key_env.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "provider '{}' needs base_url and api_key_env",
                    provider.id
                )));
            }
        }
        let providers = self
            .providers
            .iter()
            .cloned()
            .map(|spec| Provider::with_key(spec, None))
            .collect();
        ModelRegistry::new(providers, &self.models)
            .map(|_| ())
            .map_err(|e| ConfigError::Validation(e.to_string()))
    }

    /// Build the model registry, reading credentials from the environment
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the provider/model tables are inconsistent.
    pub fn registry(&self) -> Result<ModelRegistry, ConfigError> {
        let providers = self.providers.iter().cloned().map(Provider::from_env).collect();
        ModelRegistry::new(providers, &self.models).map_err(|e| ConfigError::Validation(e.to_string()))
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("llm-council").join("council.toml"))
}

/// Load configuration from the default path, then the environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be read, parsed or
/// validated. A missing config file is not an error.
pub fn load_config() -> Result<CouncilConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path, then the environment
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed or validated.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<CouncilConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration with an explicit environment lookup
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed or validated.
pub fn load_config_with_env(
    path: Option<PathBuf>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<CouncilConfig, ConfigError> {
    let mut config = CouncilConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content = std::fs::read_to_string(config_path).map_err(|e| ConfigError::Read {
                path: config_path.clone(),
                source: e,
            })?;
            let toml_config: CouncilToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, toml_config);
            config.config_file_path = Some(config_path.clone());

            tracing::info!(path = %config_path.display(), "Loaded configuration from file");
        } else {
            tracing::debug!(path = %config_path.display(), "Config file not found, using defaults");
        }
    }

    apply_env_config(&mut config, env);
    config.validate()?;
    Ok(config)
}

/// Parse configuration text without touching the filesystem or environment
///
/// # Errors
///
/// Returns `Parse` or `Validation`.
pub fn parse_config(text: &str) -> Result<CouncilConfig, ConfigError> {
    let mut config = CouncilConfig::default();
    apply_toml_config(&mut config, toml::from_str(text)?);
    config.validate()?;
    Ok(config)
}

fn apply_toml_config(config: &mut CouncilConfig, toml: CouncilToml) {
    let file = ConfigSource::File;

    if let Some(addr) = toml.server.bind_address {
        config.server.bind_address = addr;
        config.set_source("server.bind_address", file);
    }
    if let Some(n) = toml.server.max_connections {
        config.server.max_connections = n;
        config.set_source("server.max_connections", file);
    }
    if let Some(n) = toml.server.outbound_capacity {
        config.server.outbound_capacity = n;
        config.set_source("server.outbound_capacity", file);
    }
    if let Some(size) = toml.server.max_message_size {
        config.server.max_message_size = size;
        config.set_source("server.max_message_size", file);
    }

    if let Some(secs) = toml.dispatch.upstream_timeout_secs {
        config.dispatch.upstream_timeout = Duration::from_secs(secs);
        config.set_source("dispatch.upstream_timeout_secs", file);
    }
    if let Some(n) = toml.dispatch.max_context_messages {
        config.dispatch.max_context_messages = n;
        config.set_source("dispatch.max_context_messages", file);
    }
    if let Some(t) = toml.dispatch.temperature {
        config.dispatch.temperature = t.clamp(0.0, 2.0);
        config.set_source("dispatch.temperature", file);
    }
    if let Some(n) = toml.dispatch.max_tokens {
        config.dispatch.max_tokens = n;
        config.set_source("dispatch.max_tokens", file);
    }

    if let Some(url) = toml.client.url {
        config.client.url = url;
        config.set_source("client.url", file);
    }
    if let Some(ms) = toml.client.reconnect_delay_ms {
        config.client.reconnect_delay = Duration::from_millis(ms);
        config.set_source("client.reconnect_delay_ms", file);
    }

    if !toml.providers.is_empty() {
        for (id, entry) in toml.providers {
            merge_provider(&mut config.providers, id, entry);
        }
        config.set_source("providers", file);
    }
    if !toml.models.is_empty() {
        config.models = toml.models;
        config.set_source("models", file);
    }
}

fn merge_provider(providers: &mut Vec<ProviderSpec>, id: String, entry: ProviderToml) {
    let index = match providers.iter().position(|p| p.id == id) {
        Some(index) => index,
        None => {
            providers.push(ProviderSpec {
                name: id.clone(),
                id,
                base_url: String::new(),
                api_key_env: String::new(),
                description: String::new(),
            });
            providers.len() - 1
        }
    };
    let spec = &mut providers[index];
    if let Some(name) = entry.name {
        spec.name = name;
    }
    if let Some(url) = entry.base_url {
        spec.base_url = url.trim_end_matches('/').to_string();
    }
    if let Some(var) = entry.api_key_env {
        spec.api_key_env = var;
    }
    if let Some(description) = entry.description {
        spec.description = description;
    }
}

fn apply_env_config(config: &mut CouncilConfig, env: impl Fn(&str) -> Option<String>) {
    let from_env = ConfigSource::Env;

    if let Some(addr) = env(ENV_BIND).filter(|v| !v.is_empty()) {
        config.server.bind_address = addr;
        config.set_source("server.bind_address", from_env);
    }
    if let Some(secs) = env(ENV_UPSTREAM_TIMEOUT_SECS).and_then(|v| v.parse::<u64>().ok()) {
        config.dispatch.upstream_timeout = Duration::from_secs(secs);
        config.set_source("dispatch.upstream_timeout_secs", from_env);
    }
    if let Some(url) = env(ENV_URL).filter(|v| !v.is_empty()) {
        config.client.url = url;
        config.set_source("client.url", from_env);
    }
    if let Some(ms) = env(ENV_RECONNECT_DELAY_MS).and_then(|v| v.parse::<u64>().ok()) {
        config.client.reconnect_delay = Duration::from_millis(ms);
        config.set_source("client.reconnect_delay_ms", from_env);
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Command-line overrides, applied after [`load_config`]
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Bind address override
    pub bind_address: Option<String>,

    /// Upstream timeout override (seconds)
    pub upstream_timeout_secs: Option<u64>,

    /// Client URL override
    pub url: Option<String>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set bind address override
    #[must_use]
    pub fn with_bind_address(mut self, addr: impl Into<String>) -> Self {
        self.bind_address = Some(addr.into());
        self
    }

    /// Set upstream timeout override
    #[must_use]
    pub fn with_upstream_timeout_secs(mut self, secs: u64) -> Self {
        self.upstream_timeout_secs = Some(secs);
        self
    }

    /// Set client URL override
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Apply overrides to a configuration
    ///
    /// # Errors
    ///
    /// Returns `Validation` if an override produces an invalid configuration.
    pub fn apply(&self, config: &mut CouncilConfig) -> Result<(), ConfigError> {
        if let Some(ref addr) = self.bind_address {
            config.server.bind_address = addr.clone();
            config.set_source("server.bind_address", ConfigSource::Cli);
        }
        if let Some(secs) = self.upstream_timeout_secs {
            config.dispatch.upstream_timeout = Duration::from_secs(secs);
            config.set_source("dispatch.upstream_timeout_secs", ConfigSource::Cli);
        }
        if let Some(ref url) = self.url {
            config.client.url = url.clone();
            config.set_source("client.url", ConfigSource::Cli);
        }
        config.validate()
    }
}
