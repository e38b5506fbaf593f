use super::schema::SchemaError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Transport-level failures on one conduit. Everything carries the server
/// name so log lines and record diagnostics stay attributable.
#[derive(Debug, Error)]
pub enum ConduitError {
    #[error("failed to spawn capability server '{server}': {source}")]
    Spawn {
        server: String,
        #[source]
        source: std::io::Error,
    },
    #[error("capability server '{server}' transport error: {message}")]
    Transport { server: String, message: String },
    #[error("capability server '{server}' sent invalid JSON: {source}")]
    InvalidJson {
        server: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("capability server '{server}' returned JSON-RPC error {code}: {message}")]
    Rpc {
        server: String,
        code: i64,
        message: String,
    },
    #[error("request to capability server '{server}' timed out after {timeout:?}")]
    Timeout { server: String, timeout: Duration },
    #[error("capability server '{server}' terminated")]
    Terminated { server: String },
    #[error("conduit to capability server '{server}' is degraded; restart it to recover")]
    Degraded { server: String },
    #[error("request to capability server '{server}' was abandoned")]
    Cancelled { server: String },
}

impl ConduitError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Manifest lifecycle failures: discovery over a conduit, validation of the
/// listing, or the on-disk cache.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("capability server '{server}' is not configured")]
    UnknownServer { server: String },
    #[error("discovery on capability server '{server}' failed: {source}")]
    Discovery {
        server: String,
        #[source]
        source: ConduitError,
    },
    #[error("capability server '{server}' returned an invalid catalogue: {source}")]
    InvalidCatalogue {
        server: String,
        #[source]
        source: SchemaError,
    },
    #[error("failed to write manifest at {path:?}: {source}")]
    Store {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode manifest for capability server '{server}': {source}")]
    Encode {
        server: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Failures surfaced by `invoke` and `fetch_full` that are not recorded as
/// invocation outcomes: resolution happens before any process exists, and
/// persistence or pointer problems are bridge-side faults.
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("invalid tool address '{address}': expected server/tool")]
    BadAddress { address: String },
    #[error("capability server '{server}' is not configured")]
    UnknownServer { server: String },
    #[error("no cached manifest for capability server '{server}'; run discovery first")]
    Undiscovered { server: String },
    #[error("tool '{tool}' is not in the manifest of capability server '{server}'")]
    UnknownTool { server: String, tool: String },
    #[error("failed to persist invocation record at {path:?}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode invocation record: {source}")]
    Encode {
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid result pointer '{pointer}'")]
    BadPointer { pointer: String },
    #[error("no stored result for pointer '{pointer}'")]
    RecordNotFound { pointer: String },
    #[error("failed to read invocation record at {path:?}: {source}")]
    ReadRecord {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("stored invocation record at {path:?} is corrupt: {source}")]
    CorruptRecord {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
