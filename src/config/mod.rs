use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Once;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const DEFAULT_CONFIG_PATH: &str = "config/bridge.toml";
pub const CONFIG_PATH: &str = DEFAULT_CONFIG_PATH;
/// Environment file preloaded before config parsing so `${VAR}` references
/// in launch specs resolve against it.
pub const ENV_PATH: &str = "config/.env";

const DEFAULT_STATE_DIR: &str = ".gangway";
const DEFAULT_SYNOPSIS_CHARS: usize = 500;
const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;
const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 10;

static ENV_LOADER: Once = Once::new();

pub fn ensure_env_loaded() {
    ENV_LOADER.call_once(|| {
        let _ = dotenvy::from_filename(ENV_PATH);
    });
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config from {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config from {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error(
        "invalid server name {name:?}: names must be non-empty and contain only \
         alphanumerics, '-' or '_'"
    )]
    InvalidServerName { name: String },
    #[error("server {name:?} is configured more than once")]
    DuplicateServer { name: String },
    #[error("server {name:?} has an empty command")]
    EmptyCommand { name: String },
}

/// Launch specification for one capability server.
///
/// The name doubles as the manifest file stem and the prefix of every
/// `server/tool` address, so it is restricted to path-safe characters at
/// load time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub name: String,
    pub command: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawServer {
    name: String,
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
}

impl From<RawServer> for ServerConfig {
    fn from(raw: RawServer) -> Self {
        let expand = |s: &str| -> String {
            shellexpand::full(s)
                .map(|cow| cow.into_owned())
                .unwrap_or_else(|_| s.to_string())
        };

        let command = PathBuf::from(expand(&raw.command));
        let args = raw.args.iter().map(|arg| expand(arg)).collect();

        Self {
            name: raw.name,
            command,
            args,
            env: raw.env,
        }
    }
}

/// Tunables for the bridge itself, all optional in the file.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Root of the on-disk state (cached manifests and invocation results).
    pub state_dir: PathBuf,
    /// Character bound for the inline synopsis of an invocation result.
    pub synopsis_chars: usize,
    /// Per-request deadline for tool calls.
    pub call_timeout_secs: u64,
    /// Deadline for the spawn-and-initialize handshake.
    pub startup_timeout_secs: u64,
}

impl BridgeSettings {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn manifests_dir(&self) -> PathBuf {
        self.state_dir.join("manifests")
    }

    pub fn results_dir(&self) -> PathBuf {
        self.state_dir.join("results")
    }
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            synopsis_chars: DEFAULT_SYNOPSIS_CHARS,
            call_timeout_secs: DEFAULT_CALL_TIMEOUT_SECS,
            startup_timeout_secs: DEFAULT_STARTUP_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct RawBridge {
    state_dir: Option<String>,
    synopsis_chars: Option<usize>,
    call_timeout_secs: Option<u64>,
    startup_timeout_secs: Option<u64>,
}

impl From<RawBridge> for BridgeSettings {
    fn from(raw: RawBridge) -> Self {
        let defaults = BridgeSettings::default();
        let state_dir = raw
            .state_dir
            .map(|s| {
                PathBuf::from(
                    shellexpand::full(&s)
                        .map(|cow| cow.into_owned())
                        .unwrap_or(s),
                )
            })
            .unwrap_or(defaults.state_dir);
        Self {
            state_dir,
            synopsis_chars: raw.synopsis_chars.unwrap_or(defaults.synopsis_chars),
            call_timeout_secs: raw.call_timeout_secs.unwrap_or(defaults.call_timeout_secs),
            startup_timeout_secs: raw
                .startup_timeout_secs
                .unwrap_or(defaults.startup_timeout_secs),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    servers: Vec<RawServer>,
    #[serde(default)]
    bridge: RawBridge,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub servers: Vec<ServerConfig>,
    pub bridge: BridgeSettings,
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        ensure_env_loaded();
        if let Some(path) = path {
            return read_config(path);
        }
        let default_path = Path::new(DEFAULT_CONFIG_PATH);
        match read_config(default_path) {
            Ok(config) => Ok(config),
            Err(ConfigError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                info!("Configuration file not found; using defaults");
                Ok(Self::default())
            }
            Err(other) => Err(other),
        }
    }

    pub fn server(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|s| s.name == name)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            bridge: BridgeSettings::default(),
        }
    }
}

fn read_config(path: &Path) -> Result<AppConfig, ConfigError> {
    debug!(path = %path.display(), "Reading bridge configuration file");
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed: RawConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    validate(parsed)
}

fn validate(parsed: RawConfig) -> Result<AppConfig, ConfigError> {
    let mut servers: Vec<ServerConfig> = Vec::with_capacity(parsed.servers.len());
    for raw in parsed.servers {
        if !is_valid_server_name(&raw.name) {
            return Err(ConfigError::InvalidServerName { name: raw.name });
        }
        let server = ServerConfig::from(raw);
        if server.command.as_os_str().is_empty() {
            return Err(ConfigError::EmptyCommand { name: server.name });
        }
        if servers.iter().any(|existing| existing.name == server.name) {
            return Err(ConfigError::DuplicateServer { name: server.name });
        }
        servers.push(server);
    }

    Ok(AppConfig {
        servers,
        bridge: BridgeSettings::from(parsed.bridge),
    })
}

fn is_valid_server_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
