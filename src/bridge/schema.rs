use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

/// Bumped when the on-disk manifest layout changes shape.
pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

/// Rough prompt-cost divisor: 4 chars per token.
const CHARS_PER_TOKEN: usize = 4;

/// First line of a description is capped to this many chars in the lean
/// rendering so one verbose tool cannot hog the summary budget.
const LEAN_DESCRIPTION_CHARS: usize = 100;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("capability server '{server}' listed tool '{name}' more than once")]
    DuplicateTool { server: String, name: String },
}

/// Compact descriptor for one tool: identity, description and the verbatim
/// JSON schemas. Everything else a listing response carries is dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

impl ToolDescriptor {
    fn from_listing_entry(entry: &Value) -> Option<Self> {
        let name = entry.get("name").and_then(Value::as_str)?;
        if name.is_empty() {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            description: entry
                .get("description")
                .and_then(Value::as_str)
                .map(|text| text.to_string()),
            input_schema: entry.get("inputSchema").cloned(),
            output_schema: entry.get("outputSchema").cloned(),
        })
    }

    /// First line of the description capped for the lean summary; tools
    /// without a description fall back to their own name.
    pub fn short_description(&self) -> String {
        let first_line = self
            .description
            .as_deref()
            .and_then(|text| text.lines().next())
            .filter(|line| !line.trim().is_empty())
            .unwrap_or(&self.name);
        first_line.chars().take(LEAN_DESCRIPTION_CHARS).collect()
    }

    /// One-line rendering used by the lean summary and savings estimate.
    pub fn lean_line(&self, server: &str) -> String {
        format!("{server}/{} — {}", self.name, self.short_description())
    }

    /// Indented text block for on-demand inspection of a single tool.
    pub fn full_text(&self, server: &str) -> String {
        let mut lines = vec![format!("Tool: {server}/{}", self.name)];
        if let Some(description) = &self.description {
            for line in description.lines() {
                lines.push(format!("  {line}"));
            }
        }
        lines.push("  Parameters:".to_string());
        match self.input_schema.as_ref().and_then(schema_params) {
            Some(params) if !params.is_empty() => lines.extend(params),
            _ => lines.push("    (none)".to_string()),
        }
        if let Some(schema) = &self.output_schema {
            lines.push("  Output schema:".to_string());
            let rendered = serde_json::to_string_pretty(schema).unwrap_or_default();
            for line in rendered.lines() {
                lines.push(format!("    {line}"));
            }
        }
        lines.join("\n")
    }
}

fn schema_params(schema: &Value) -> Option<Vec<String>> {
    let properties = schema.get("properties").and_then(Value::as_object)?;
    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|entries| entries.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let mut lines = Vec::with_capacity(properties.len());
    for (name, info) in properties {
        let kind = info.get("type").and_then(Value::as_str).unwrap_or("any");
        let marker = if required.contains(&name.as_str()) {
            " (required)"
        } else {
            ""
        };
        let mut line = format!("    - {name}: {kind}{marker}");
        if let Some(description) = info.get("description").and_then(Value::as_str) {
            let short: String = description.chars().take(80).collect();
            line.push_str(": ");
            line.push_str(&short);
        }
        lines.push(line);
    }
    Some(lines)
}

/// Per-server tool catalogue cached at `<state_dir>/manifests/<server>.json`.
///
/// Tools are kept name-sorted so the fingerprint and the lean rendering are
/// stable across refreshes that change nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: u32,
    pub server: String,
    pub fingerprint: String,
    pub refreshed_at: DateTime<Utc>,
    /// Estimated prompt cost of the raw listing response.
    pub full_listing_tokens: usize,
    /// Estimated prompt cost of this server's lean lines.
    pub lean_tokens: usize,
    pub tools: Vec<ToolDescriptor>,
}

impl Manifest {
    /// Build a manifest from a `tools/list` result's `tools` array.
    ///
    /// Entries without a name are skipped; duplicate names are an error
    /// because `server/tool` must resolve to exactly one descriptor.
    pub fn from_listing(server: &str, raw_tools: &[Value]) -> Result<Self, SchemaError> {
        let mut listing_chars = 0usize;
        let mut tools: Vec<ToolDescriptor> = Vec::with_capacity(raw_tools.len());
        for entry in raw_tools {
            listing_chars += entry.to_string().chars().count();
            if let Some(descriptor) = ToolDescriptor::from_listing_entry(entry) {
                if tools.iter().any(|t| t.name == descriptor.name) {
                    return Err(SchemaError::DuplicateTool {
                        server: server.to_string(),
                        name: descriptor.name,
                    });
                }
                tools.push(descriptor);
            }
        }
        tools.sort_by(|a, b| a.name.cmp(&b.name));

        let lean_chars: usize = tools
            .iter()
            .map(|tool| tool.lean_line(server).chars().count() + 1)
            .sum();

        Ok(Self {
            schema_version: MANIFEST_SCHEMA_VERSION,
            server: server.to_string(),
            fingerprint: compute_fingerprint(&tools),
            refreshed_at: Utc::now(),
            full_listing_tokens: approx_tokens(listing_chars),
            lean_tokens: approx_tokens(lean_chars),
            tools,
        })
    }

    pub fn tool(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|tool| tool.name == name)
    }

    pub fn token_savings(&self) -> usize {
        self.full_listing_tokens.saturating_sub(self.lean_tokens)
    }

    pub fn token_savings_pct(&self) -> f64 {
        if self.full_listing_tokens == 0 {
            return 0.0;
        }
        self.token_savings() as f64 / self.full_listing_tokens as f64 * 100.0
    }
}

/// SHA-256 over the name-ordered (name, description, input schema) tuples.
///
/// `serde_json::Value` keeps object keys in sorted order, so serializing a
/// schema is deterministic and the digest only moves when the catalogue
/// meaningfully changes.
pub fn compute_fingerprint(tools: &[ToolDescriptor]) -> String {
    let mut hasher = Sha256::new();
    for tool in tools {
        hasher.update(tool.name.as_bytes());
        hasher.update([0u8]);
        if let Some(description) = &tool.description {
            hasher.update(description.as_bytes());
        }
        hasher.update([0u8]);
        if let Some(schema) = &tool.input_schema {
            hasher.update(serde_json::to_string(schema).unwrap_or_default().as_bytes());
        }
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

pub fn approx_tokens(chars: usize) -> usize {
    chars / CHARS_PER_TOKEN
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvocationStatus {
    Ok,
    ToolError,
    TransportError,
    Timeout,
}

impl InvocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::ToolError => "tool-error",
            Self::TransportError => "transport-error",
            Self::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of one tool invocation, written once to
/// `<state_dir>/results/<id>.json` and never rewritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRecord {
    pub id: Uuid,
    /// Monotonic within one bridge run; audit ordering across runs falls to
    /// `recorded_at`.
    pub sequence: u64,
    pub server: String,
    pub tool: String,
    pub arguments: Value,
    pub status: InvocationStatus,
    /// Verbatim result payload for `ok` and `tool-error` calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Diagnostic text for calls that never produced a payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub synopsis: String,
    pub duration_ms: u64,
    pub recorded_at: DateTime<Utc>,
}
