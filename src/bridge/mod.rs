//! The tool bridge: spawned capability servers behind cached manifests,
//! budgeted summaries and persisted invocation results.

mod conduit;
mod error;
mod executor;
mod pool;
mod registry;
mod schema;

pub use conduit::{Conduit, ConduitSettings, Phase};
pub use error::{ConduitError, InvokeError, RegistryError};
pub use executor::{InvocationExecutor, InvocationOutcome};
pub use pool::ConduitPool;
pub use registry::{
    Availability, ManifestRegistry, RefreshOutcome, SavingsReport, ServerOverview, ServerSavings,
};
pub use schema::{InvocationRecord, InvocationStatus, Manifest, SchemaError, ToolDescriptor};

use crate::config::AppConfig;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Engine-facing surface over the pool, the manifest registry and the
/// invocation executor. One instance per bridge run.
pub struct ToolBridge {
    pool: Arc<ConduitPool>,
    registry: Arc<ManifestRegistry>,
    executor: InvocationExecutor,
}

impl ToolBridge {
    pub fn new(config: &AppConfig) -> Self {
        let settings = ConduitSettings {
            startup_timeout: config.bridge.startup_timeout(),
            call_timeout: config.bridge.call_timeout(),
        };
        let pool = Arc::new(ConduitPool::new(config.servers.clone(), settings));
        let registry = Arc::new(ManifestRegistry::new(
            Arc::clone(&pool),
            config.bridge.manifests_dir(),
        ));
        let executor = InvocationExecutor::new(
            Arc::clone(&pool),
            Arc::clone(&registry),
            config.bridge.results_dir(),
            config.bridge.synopsis_chars,
        );
        Self {
            pool,
            registry,
            executor,
        }
    }

    /// Prime the manifest cache from disk; call once before serving.
    pub async fn load_cached_manifests(&self) {
        self.registry.load_all().await;
    }

    pub async fn lean_summary(&self, budget: usize) -> String {
        self.registry.lean_summary(budget).await
    }

    pub async fn prompt_fragment(&self, budget: usize) -> String {
        self.registry.prompt_fragment(budget).await
    }

    /// Run `server/tool` with `arguments`; see [`InvocationExecutor::invoke`].
    pub async fn invoke(
        &self,
        address: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> Result<InvocationOutcome, InvokeError> {
        let (server, tool) = split_address(address)?;
        self.executor.invoke(server, tool, arguments, timeout).await
    }

    pub fn fetch_full(&self, pointer: &str) -> Result<InvocationRecord, InvokeError> {
        self.executor.fetch_full(pointer)
    }

    /// Re-discover one server. Refresh is an explicit operator action, so a
    /// degraded or terminated conduit is replaced first; the invoke path
    /// never does this.
    pub async fn refresh(&self, server: &str) -> Result<RefreshOutcome, RegistryError> {
        self.revive_if_dead(server).await;
        self.registry.discover(server).await
    }

    pub async fn refresh_all(&self) -> Vec<(String, Result<RefreshOutcome, RegistryError>)> {
        for name in self.pool.server_names() {
            self.revive_if_dead(&name).await;
        }
        self.registry.refresh_all().await
    }

    pub async fn describe(&self, address: &str) -> Result<String, InvokeError> {
        let (server, tool) = split_address(address)?;
        if !self.pool.is_configured(server) {
            return Err(InvokeError::UnknownServer {
                server: server.to_string(),
            });
        }
        let manifest =
            self.registry
                .manifest(server)
                .await
                .ok_or_else(|| InvokeError::Undiscovered {
                    server: server.to_string(),
                })?;
        let descriptor = manifest.tool(tool).ok_or_else(|| InvokeError::UnknownTool {
            server: server.to_string(),
            tool: tool.to_string(),
        })?;
        Ok(descriptor.full_text(server))
    }

    pub async fn overview(&self) -> Vec<ServerOverview> {
        self.registry.overview().await
    }

    pub async fn savings(&self) -> SavingsReport {
        self.registry.savings().await
    }

    /// Replace the conduit for `server` with a fresh unstarted one.
    pub async fn restart(&self, server: &str) -> Result<(), RegistryError> {
        match self.pool.restart(server).await {
            Some(_) => Ok(()),
            None => Err(RegistryError::UnknownServer {
                server: server.to_string(),
            }),
        }
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown_all().await;
    }

    async fn revive_if_dead(&self, server: &str) {
        if let Some(conduit) = self.pool.conduit(server) {
            if matches!(conduit.phase(), Phase::Degraded | Phase::Terminated) {
                self.pool.restart(server).await;
            }
        }
    }
}

fn split_address(address: &str) -> Result<(&str, &str), InvokeError> {
    match address.split_once('/') {
        Some((server, tool)) if !server.is_empty() && !tool.is_empty() => Ok((server, tool)),
        _ => Err(InvokeError::BadAddress {
            address: address.to_string(),
        }),
    }
}
