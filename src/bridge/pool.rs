use super::conduit::{Conduit, ConduitSettings};
use crate::config::ServerConfig;
use std::collections::HashMap;
use std::sync::Mutex;

/// One conduit per configured capability server, shared by discovery and
/// invocation so both talk to the same process.
///
/// Handing out a conduit never spawns anything; the process starts on first
/// use. Dead conduits stay in the map and keep failing fast until someone
/// asks for an explicit `restart`.
pub struct ConduitPool {
    configs: HashMap<String, ServerConfig>,
    settings: ConduitSettings,
    instances: Mutex<HashMap<String, Conduit>>,
}

impl ConduitPool {
    pub fn new(servers: Vec<ServerConfig>, settings: ConduitSettings) -> Self {
        let configs = servers
            .into_iter()
            .map(|cfg| (cfg.name.clone(), cfg))
            .collect();
        Self {
            configs,
            settings,
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_configured(&self, server: &str) -> bool {
        self.configs.contains_key(server)
    }

    /// Configured server names in stable order.
    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get or lazily create the shared conduit for `server`.
    pub fn conduit(&self, server: &str) -> Option<Conduit> {
        let mut instances = self.instances.lock().expect("conduit pool lock");
        if let Some(existing) = instances.get(server) {
            return Some(existing.clone());
        }
        let config = self.configs.get(server)?.clone();
        let conduit = Conduit::new(config, self.settings);
        instances.insert(server.to_string(), conduit.clone());
        Some(conduit)
    }

    /// Replace the conduit for `server` with a fresh unstarted one, then
    /// tear down the one it displaced. The only recovery path for a
    /// degraded or terminated conduit.
    ///
    /// The swap is a single critical section: a concurrent lookup sees
    /// either the old conduit or its replacement, never an empty slot it
    /// would fill with an instance nobody tears down.
    pub async fn restart(&self, server: &str) -> Option<Conduit> {
        let config = self.configs.get(server)?.clone();
        let fresh = Conduit::new(config, self.settings);
        let old = {
            let mut instances = self.instances.lock().expect("conduit pool lock");
            instances.insert(server.to_string(), fresh.clone())
        };
        if let Some(old) = old {
            old.shutdown().await;
        }
        Some(fresh)
    }

    pub async fn shutdown_all(&self) {
        let drained: Vec<Conduit> = {
            let mut instances = self.instances.lock().expect("conduit pool lock");
            instances.drain().map(|(_, conduit)| conduit).collect()
        };
        for conduit in drained {
            conduit.shutdown().await;
        }
    }
}
