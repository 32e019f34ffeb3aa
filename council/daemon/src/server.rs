//! Daemon Server Assembly
//!
//! Wires the council collaborators together from a resolved
//! [`CouncilConfig`] and runs the duplex WebSocket server:
//!
//! ```text
//!                      DaemonServer
//!                           │
//!        ┌──────────────────┼──────────────────┐
//!        │                  │                  │
//!   ModelProvider     InMemoryHistory     UsageLedger
//!  (HTTP or scripted)       │                  │
//!        └────────────► Dispatcher ◄───────────┘
//!                           │
//!                     CouncilServer
//!                  (one session per socket)
//! ```

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use council_core::{
    CouncilConfig, CouncilServer, Dispatcher, InMemoryHistory, ModelProvider, OpenAiCompatibleBackend,
    ScriptedBackend, UsageLedger, UsagePeriod,
};

/// Where model completions come from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpstreamMode {
    /// Real OpenAI-compatible providers, credentials from the environment
    Live,
    /// Canned offline models
    Offline,
}

/// The assembled daemon
pub struct DaemonServer {
    config: CouncilConfig,
    provider: Arc<dyn ModelProvider>,
    usage: Arc<UsageLedger>,
}

impl DaemonServer {
    /// Build the provider stack for `config`
    ///
    /// # Errors
    ///
    /// Returns an error if the model registry is inconsistent or the HTTP
    /// client cannot be created.
    pub fn new(config: CouncilConfig, mode: UpstreamMode) -> Result<Self> {
        let provider = build_provider(&config, mode)?;
        Ok(Self {
            config,
            provider,
            usage: Arc::new(UsageLedger::new()),
        })
    }

    /// The provider requests are dispatched to
    pub fn provider(&self) -> &Arc<dyn ModelProvider> {
        &self.provider
    }

    /// Log which models can actually be dispatched to
    pub async fn log_available_models(&self) {
        match self.provider.available_models().await {
            Ok(models) if models.is_empty() => {
                warn!("No model has credentials; every chat request will be rejected");
            }
            Ok(models) => {
                let ids: Vec<&str> = models.iter().map(|m| m.id.as_str()).collect();
                info!(count = models.len(), models = ?ids, "Models available");
            }
            Err(e) => warn!(error = %e, "Failed to list models"),
        }
    }

    /// Serve until `shutdown` is set
    ///
    /// # Errors
    ///
    /// Returns an error if the listen address cannot be bound.
    pub async fn run(&self, shutdown: Arc<AtomicBool>) -> Result<()> {
        let dispatcher = Dispatcher::new(
            Arc::clone(&self.provider),
            Arc::new(InMemoryHistory::new()),
            self.usage.clone(),
            self.config.dispatch.clone(),
        );
        let server = CouncilServer::new(self.config.server.clone(), dispatcher);

        info!(
            bind = %self.config.server.bind_address,
            upstream = self.provider.name(),
            upstream_timeout_secs = self.config.dispatch.upstream_timeout.as_secs(),
            "Starting council server"
        );
        self.log_available_models().await;

        let result = server.run(shutdown).await;

        let usage = self.usage.summary(UsagePeriod::All);
        info!(
            models = usage.summary.model_count,
            total_tokens = usage.summary.total_tokens,
            estimated_cost = usage.summary.total_estimated_cost,
            "Usage since start"
        );
        result
    }
}

fn build_provider(config: &CouncilConfig, mode: UpstreamMode) -> Result<Arc<dyn ModelProvider>> {
    match mode {
        UpstreamMode::Offline => {
            info!("Using offline scripted models");
            Ok(Arc::new(ScriptedBackend::demo()))
        }
        UpstreamMode::Live => {
            let registry = config.registry().context("Invalid model configuration")?;
            let backend = OpenAiCompatibleBackend::new(Arc::new(registry))
                .context("Failed to create upstream HTTP client")?;
            Ok(Arc::new(backend))
        }
    }
}
