use super::error::{ConduitError, InvokeError};
use super::pool::ConduitPool;
use super::registry::ManifestRegistry;
use super::schema::{InvocationRecord, InvocationStatus};
use chrono::Utc;
use serde_json::Value;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::info;
use uuid::Uuid;

const TRUNCATION_MARKER: &str = "… [truncated]";
const EMPTY_OUTPUT: &str = "(empty output)";

/// What the reasoning engine gets back inline: a bounded synopsis and the
/// pointer for retrieving the full record later.
#[derive(Debug, Clone)]
pub struct InvocationOutcome {
    pub pointer: Uuid,
    pub status: InvocationStatus,
    pub synopsis: String,
    pub duration_ms: u64,
}

/// Runs tool calls and keeps their full results out of the caller's
/// context: every call that reaches a conduit is persisted verbatim under
/// `<state_dir>/results/` and summarised down to `synopsis_chars`.
pub struct InvocationExecutor {
    pool: Arc<ConduitPool>,
    registry: Arc<ManifestRegistry>,
    results_dir: PathBuf,
    synopsis_chars: usize,
    sequence: AtomicU64,
}

impl InvocationExecutor {
    pub fn new(
        pool: Arc<ConduitPool>,
        registry: Arc<ManifestRegistry>,
        results_dir: PathBuf,
        synopsis_chars: usize,
    ) -> Self {
        Self {
            pool,
            registry,
            results_dir,
            synopsis_chars,
            sequence: AtomicU64::new(1),
        }
    }

    /// Resolve `server`/`tool` against the cached manifests and run the
    /// call.
    ///
    /// Resolution failures return an error before any process is spawned
    /// and leave no record. Once the call reaches the conduit, exactly one
    /// record is written whatever the outcome; the status tells transport
    /// failures, timeouts and tool-reported errors apart.
    pub async fn invoke(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> Result<InvocationOutcome, InvokeError> {
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
        if manifest.tool(tool).is_none() {
            return Err(InvokeError::UnknownTool {
                server: server.to_string(),
                tool: tool.to_string(),
            });
        }
        let conduit = self
            .pool
            .conduit(server)
            .ok_or_else(|| InvokeError::UnknownServer {
                server: server.to_string(),
            })?;

        let started = Instant::now();
        let call = conduit.call_tool(tool, arguments.clone(), timeout).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (status, result, error) = classify(call);
        let synopsis = match (&result, &error) {
            (Some(payload), _) => {
                truncate_synopsis(&render_payload_text(payload), self.synopsis_chars)
            }
            (None, Some(diagnostic)) => truncate_synopsis(
                &format!("[{}] {diagnostic}", status.as_str()),
                self.synopsis_chars,
            ),
            (None, None) => EMPTY_OUTPUT.to_string(),
        };

        let record = InvocationRecord {
            id: Uuid::new_v4(),
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            server: server.to_string(),
            tool: tool.to_string(),
            arguments,
            status,
            result,
            error,
            synopsis,
            duration_ms,
            recorded_at: Utc::now(),
        };
        self.persist(&record)?;
        info!(
            server,
            tool,
            status = %record.status,
            duration_ms,
            record_id = %record.id,
            "invocation recorded"
        );

        Ok(InvocationOutcome {
            pointer: record.id,
            status: record.status,
            synopsis: record.synopsis,
            duration_ms,
        })
    }

    /// Dereference a pointer returned by `invoke`.
    ///
    /// The pointer must parse as a UUID before any path is formed, so a
    /// crafted pointer can never address a file outside the results
    /// directory.
    pub fn fetch_full(&self, pointer: &str) -> Result<InvocationRecord, InvokeError> {
        let id = Uuid::parse_str(pointer).map_err(|_| InvokeError::BadPointer {
            pointer: pointer.to_string(),
        })?;
        let path = self.record_path(&id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(InvokeError::RecordNotFound {
                    pointer: pointer.to_string(),
                });
            }
            Err(source) => return Err(InvokeError::ReadRecord { path, source }),
        };
        serde_json::from_str(&content).map_err(|source| InvokeError::CorruptRecord { path, source })
    }

    fn record_path(&self, id: &Uuid) -> PathBuf {
        self.results_dir.join(format!("{id}.json"))
    }

    fn persist(&self, record: &InvocationRecord) -> Result<(), InvokeError> {
        fs::create_dir_all(&self.results_dir).map_err(|source| InvokeError::Persist {
            path: self.results_dir.clone(),
            source,
        })?;
        let path = self.record_path(&record.id);
        let encoded =
            serde_json::to_string_pretty(record).map_err(|source| InvokeError::Encode { source })?;
        fs::write(&path, encoded).map_err(|source| InvokeError::Persist { path, source })?;
        Ok(())
    }
}

fn classify(
    call: Result<Value, ConduitError>,
) -> (InvocationStatus, Option<Value>, Option<String>) {
    match call {
        Ok(payload) => {
            let tool_failed = payload
                .get("isError")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if tool_failed {
                (InvocationStatus::ToolError, Some(payload), None)
            } else {
                (InvocationStatus::Ok, Some(payload), None)
            }
        }
        // The server answered with a JSON-RPC error: the transport works,
        // the tool layer refused the call.
        Err(err @ ConduitError::Rpc { .. }) => {
            (InvocationStatus::ToolError, None, Some(err.to_string()))
        }
        Err(err) if err.is_timeout() => (InvocationStatus::Timeout, None, Some(err.to_string())),
        Err(err) => (InvocationStatus::TransportError, None, Some(err.to_string())),
    }
}

/// Text form of a stored payload: the `text` of each content part joined
/// with newlines, or compact JSON when the payload has no content parts.
fn render_payload_text(payload: &Value) -> String {
    let parts = match payload.get("content").and_then(Value::as_array) {
        Some(parts) if !parts.is_empty() => parts,
        _ => return payload.to_string(),
    };
    parts
        .iter()
        .map(|part| match part.get("text").and_then(Value::as_str) {
            Some(text) => text.to_string(),
            None => part.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Head-truncate to `limit` chars, ending in a fixed marker so the reader
/// knows the full output lives on disk. The result never exceeds `limit`;
/// caps too small to hold the marker get a plain hard cut.
fn truncate_synopsis(text: &str, limit: usize) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return EMPTY_OUTPUT.to_string();
    }
    if trimmed.chars().count() <= limit {
        return trimmed.to_string();
    }
    let marker_len = TRUNCATION_MARKER.chars().count();
    if limit <= marker_len {
        return trimmed.chars().take(limit).collect();
    }
    let mut out: String = trimmed.chars().take(limit - marker_len).collect();
    out.push_str(TRUNCATION_MARKER);
    out
}
