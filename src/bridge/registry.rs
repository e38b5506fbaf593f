use super::error::RegistryError;
use super::pool::ConduitPool;
use super::schema::{MANIFEST_SCHEMA_VERSION, Manifest};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const SUMMARY_HEADER: &str = "Available tools:";
const SUMMARY_FOOTER: &str = "Use tool: <server/tool> with {\"param\": \"value\"} to invoke.";

/// What the bridge currently knows about one configured server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    /// No cached manifest and no failed attempt on record.
    Undiscovered,
    /// A manifest is cached and the last discovery (if any) succeeded.
    Discovered,
    /// The last discovery attempt failed; any cached manifest stays valid.
    Unreachable,
}

impl std::fmt::Display for Availability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Undiscovered => "undiscovered",
            Self::Discovered => "discovered",
            Self::Unreachable => "unreachable",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Updated { tools: usize },
    Unchanged { tools: usize },
}

/// One row of `list` output.
#[derive(Debug, Clone)]
pub struct ServerOverview {
    pub server: String,
    pub availability: Availability,
    pub tools: usize,
    pub refreshed_at: Option<DateTime<Utc>>,
    pub tokens_saved: usize,
}

#[derive(Debug, Clone)]
pub struct ServerSavings {
    pub server: String,
    pub tools: usize,
    pub full_listing_tokens: usize,
    pub lean_tokens: usize,
}

impl ServerSavings {
    pub fn tokens_saved(&self) -> usize {
        self.full_listing_tokens.saturating_sub(self.lean_tokens)
    }

    pub fn savings_pct(&self) -> f64 {
        if self.full_listing_tokens == 0 {
            return 0.0;
        }
        self.tokens_saved() as f64 / self.full_listing_tokens as f64 * 100.0
    }
}

#[derive(Debug, Clone, Default)]
pub struct SavingsReport {
    pub servers: Vec<ServerSavings>,
}

impl SavingsReport {
    pub fn total_full(&self) -> usize {
        self.servers.iter().map(|s| s.full_listing_tokens).sum()
    }

    pub fn total_lean(&self) -> usize {
        self.servers.iter().map(|s| s.lean_tokens).sum()
    }

    pub fn total_saved(&self) -> usize {
        self.total_full().saturating_sub(self.total_lean())
    }

    pub fn total_pct(&self) -> f64 {
        let full = self.total_full();
        if full == 0 {
            return 0.0;
        }
        self.total_saved() as f64 / full as f64 * 100.0
    }
}

#[derive(Default)]
struct RegistryState {
    manifests: HashMap<String, Manifest>,
    failed: HashSet<String>,
}

/// Caches one manifest per capability server, on disk and in memory.
///
/// Discovery lists tools over the shared conduit and rewrites the cached
/// manifest only when the catalogue fingerprint moved; everything the
/// reasoning engine sees (summary, describe, resolution) is served from the
/// cache without touching a server.
pub struct ManifestRegistry {
    pool: Arc<ConduitPool>,
    manifests_dir: PathBuf,
    state: RwLock<RegistryState>,
}

impl ManifestRegistry {
    pub fn new(pool: Arc<ConduitPool>, manifests_dir: PathBuf) -> Self {
        Self {
            pool,
            manifests_dir,
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// Prime the in-memory cache from disk. Missing files are normal;
    /// corrupt or mismatched files are ignored and logged, leaving the
    /// server undiscovered.
    pub async fn load_all(&self) {
        let mut state = self.state.write().await;
        for name in self.pool.server_names() {
            let path = self.manifest_path(&name);
            match read_manifest(&path) {
                Ok(Some(manifest)) if manifest.server == name => {
                    debug!(server = %name, tools = manifest.tools.len(), "loaded cached manifest");
                    state.manifests.insert(name, manifest);
                }
                Ok(Some(manifest)) => {
                    warn!(
                        server = %name,
                        stored = %manifest.server,
                        "manifest file names a different server; ignoring"
                    );
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(server = %name, path = %path.display(), %err, "ignoring unreadable manifest");
                }
            }
        }
    }

    /// List tools on one server and refresh its cached manifest.
    ///
    /// An unchanged fingerprint rewrites nothing and keeps the stored
    /// timestamp, so repeated refreshes against an idle server are no-ops.
    pub async fn discover(&self, server: &str) -> Result<RefreshOutcome, RegistryError> {
        let conduit = self
            .pool
            .conduit(server)
            .ok_or_else(|| RegistryError::UnknownServer {
                server: server.to_string(),
            })?;

        let listing = match conduit.list_tools().await {
            Ok(listing) => listing,
            Err(source) => {
                self.mark_failed(server).await;
                return Err(RegistryError::Discovery {
                    server: server.to_string(),
                    source,
                });
            }
        };

        let raw_tools = listing
            .get("tools")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let manifest = match Manifest::from_listing(server, &raw_tools) {
            Ok(manifest) => manifest,
            Err(source) => {
                self.mark_failed(server).await;
                return Err(RegistryError::InvalidCatalogue {
                    server: server.to_string(),
                    source,
                });
            }
        };

        let tools = manifest.tools.len();
        let unchanged = {
            let state = self.state.read().await;
            state
                .manifests
                .get(server)
                .is_some_and(|cached| cached.fingerprint == manifest.fingerprint)
        };
        if unchanged {
            let mut state = self.state.write().await;
            state.failed.remove(server);
            return Ok(RefreshOutcome::Unchanged { tools });
        }

        if let Err(err) = self.persist(&manifest) {
            self.mark_failed(server).await;
            return Err(err);
        }

        let mut state = self.state.write().await;
        state.failed.remove(server);
        state.manifests.insert(server.to_string(), manifest);
        Ok(RefreshOutcome::Updated { tools })
    }

    /// Refresh every configured server, one at a time. A failure on one
    /// server never aborts the rest; each name gets its own outcome.
    pub async fn refresh_all(&self) -> Vec<(String, Result<RefreshOutcome, RegistryError>)> {
        let mut outcomes = Vec::new();
        for name in self.pool.server_names() {
            let outcome = self.discover(&name).await;
            match &outcome {
                Ok(RefreshOutcome::Updated { tools }) => {
                    info!(server = %name, tools, "manifest updated");
                }
                Ok(RefreshOutcome::Unchanged { tools }) => {
                    debug!(server = %name, tools, "manifest unchanged");
                }
                Err(err) => {
                    warn!(server = %name, %err, "discovery failed");
                }
            }
            outcomes.push((name, outcome));
        }
        outcomes
    }

    pub async fn manifest(&self, server: &str) -> Option<Manifest> {
        self.state.read().await.manifests.get(server).cloned()
    }

    pub async fn availability(&self, server: &str) -> Availability {
        let state = self.state.read().await;
        if state.failed.contains(server) {
            Availability::Unreachable
        } else if state.manifests.contains_key(server) {
            Availability::Discovered
        } else {
            Availability::Undiscovered
        }
    }

    pub async fn overview(&self) -> Vec<ServerOverview> {
        let state = self.state.read().await;
        self.pool
            .server_names()
            .into_iter()
            .map(|name| {
                let manifest = state.manifests.get(&name);
                let availability = if state.failed.contains(&name) {
                    Availability::Unreachable
                } else if manifest.is_some() {
                    Availability::Discovered
                } else {
                    Availability::Undiscovered
                };
                ServerOverview {
                    availability,
                    tools: manifest.map(|m| m.tools.len()).unwrap_or(0),
                    refreshed_at: manifest.map(|m| m.refreshed_at),
                    tokens_saved: manifest.map(|m| m.token_savings()).unwrap_or(0),
                    server: name,
                }
            })
            .collect()
    }

    /// Deterministic one-line-per-tool rendering under `budget` chars.
    pub async fn lean_summary(&self, budget: usize) -> String {
        let manifests = self.sorted_manifests().await;
        assemble_lines(&lean_entries(&manifests), budget)
    }

    /// The lean summary wrapped in its prompt framing, all within `budget`.
    pub async fn prompt_fragment(&self, budget: usize) -> String {
        let manifests = self.sorted_manifests().await;
        let entries = lean_entries(&manifests);
        if entries.is_empty() {
            return String::new();
        }

        let overhead = SUMMARY_HEADER.chars().count() + SUMMARY_FOOTER.chars().count() + 2;
        if budget <= overhead {
            return assemble_lines(&entries, budget);
        }
        let body = assemble_lines(&entries, budget - overhead);
        if body.is_empty() {
            return String::new();
        }
        format!("{SUMMARY_HEADER}\n{body}\n{SUMMARY_FOOTER}")
    }

    /// Full descriptor text for one cached tool, or None if the address
    /// does not resolve.
    pub async fn describe(&self, server: &str, tool: &str) -> Option<String> {
        let state = self.state.read().await;
        let descriptor = state.manifests.get(server)?.tool(tool)?;
        Some(descriptor.full_text(server))
    }

    pub async fn savings(&self) -> SavingsReport {
        let manifests = self.sorted_manifests().await;
        SavingsReport {
            servers: manifests
                .iter()
                .map(|manifest| ServerSavings {
                    server: manifest.server.clone(),
                    tools: manifest.tools.len(),
                    full_listing_tokens: manifest.full_listing_tokens,
                    lean_tokens: manifest.lean_tokens,
                })
                .collect(),
        }
    }

    async fn sorted_manifests(&self) -> Vec<Manifest> {
        let state = self.state.read().await;
        let mut manifests: Vec<Manifest> = state.manifests.values().cloned().collect();
        manifests.sort_by(|a, b| a.server.cmp(&b.server));
        manifests
    }

    async fn mark_failed(&self, server: &str) {
        let mut state = self.state.write().await;
        state.failed.insert(server.to_string());
    }

    fn manifest_path(&self, server: &str) -> PathBuf {
        self.manifests_dir.join(format!("{server}.json"))
    }

    fn persist(&self, manifest: &Manifest) -> Result<(), RegistryError> {
        fs::create_dir_all(&self.manifests_dir).map_err(|source| RegistryError::Store {
            path: self.manifests_dir.clone(),
            source,
        })?;
        let path = self.manifest_path(&manifest.server);
        let encoded =
            serde_json::to_string_pretty(manifest).map_err(|source| RegistryError::Encode {
                server: manifest.server.clone(),
                source,
            })?;
        fs::write(&path, encoded).map_err(|source| RegistryError::Store { path, source })?;
        Ok(())
    }
}

fn read_manifest(path: &Path) -> Result<Option<Manifest>, io::Error> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    match serde_json::from_str::<Manifest>(&content) {
        Ok(manifest) if manifest.schema_version == MANIFEST_SCHEMA_VERSION => Ok(Some(manifest)),
        Ok(manifest) => {
            warn!(
                path = %path.display(),
                version = manifest.schema_version,
                "unsupported manifest version; ignoring"
            );
            Ok(None)
        }
        Err(err) => {
            warn!(path = %path.display(), %err, "corrupt manifest; ignoring");
            Ok(None)
        }
    }
}

struct LeanLine {
    /// Chars up to and including the address separator; truncation below
    /// this would destroy the address.
    prefix_chars: usize,
    text: String,
}

fn lean_entries(manifests: &[Manifest]) -> Vec<LeanLine> {
    let mut entries = Vec::new();
    for manifest in manifests {
        for tool in &manifest.tools {
            let address_chars = manifest.server.chars().count() + 1 + tool.name.chars().count();
            entries.push(LeanLine {
                prefix_chars: address_chars + 3,
                text: tool.lean_line(&manifest.server),
            });
        }
    }
    entries
}

/// Pack entries into `budget` chars. The first entry that does not fit
/// whole gets its description cut to a trailing ellipsis; if even that is
/// impossible the entry and everything after it is omitted. Output length
/// in chars never exceeds the budget.
fn assemble_lines(entries: &[LeanLine], budget: usize) -> String {
    let mut out = String::new();
    let mut used = 0usize;
    for entry in entries {
        let sep = usize::from(!out.is_empty());
        let len = entry.text.chars().count();
        if used + sep + len <= budget {
            if sep == 1 {
                out.push('\n');
            }
            out.push_str(&entry.text);
            used += sep + len;
            continue;
        }

        let avail = budget.saturating_sub(used + sep);
        if avail > entry.prefix_chars {
            if sep == 1 {
                out.push('\n');
            }
            let truncated: String = entry.text.chars().take(avail - 1).collect();
            out.push_str(&truncated);
            out.push('…');
        }
        break;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::conduit::ConduitSettings;
    use crate::config::ServerConfig;
    use serde_json::json;
    use std::time::Duration;

    fn manifest(server: &str, tools: &[(&str, &str)]) -> Manifest {
        let entries: Vec<Value> = tools
            .iter()
            .map(|(name, desc)| json!({"name": name, "description": desc}))
            .collect();
        Manifest::from_listing(server, &entries).expect("manifest")
    }

    fn test_pool(names: &[&str]) -> Arc<ConduitPool> {
        let servers = names
            .iter()
            .map(|name| ServerConfig {
                name: name.to_string(),
                command: "true".into(),
                args: Vec::new(),
                env: HashMap::new(),
            })
            .collect();
        Arc::new(ConduitPool::new(
            servers,
            ConduitSettings {
                startup_timeout: Duration::from_secs(1),
                call_timeout: Duration::from_secs(1),
            },
        ))
    }

    #[test]
    fn summary_orders_servers_and_tools() {
        let manifests = vec![
            manifest("web", &[("screenshot", "Take a screenshot")]),
            manifest("files", &[("write", "Write a file"), ("read", "Read a file")]),
        ];
        let mut sorted = manifests.clone();
        sorted.sort_by(|a, b| a.server.cmp(&b.server));

        let output = assemble_lines(&lean_entries(&sorted), 1000);
        assert_eq!(
            output,
            "files/read — Read a file\nfiles/write — Write a file\nweb/screenshot — Take a screenshot"
        );
    }

    #[test]
    fn summary_is_deterministic() {
        let manifests = vec![manifest("files", &[("read", "Read a file")])];
        let a = assemble_lines(&lean_entries(&manifests), 40);
        let b = assemble_lines(&lean_entries(&manifests), 40);
        assert_eq!(a, b);
    }

    #[test]
    fn summary_truncates_the_first_overflowing_line() {
        let manifests = vec![manifest(
            "files",
            &[
                ("read", "Read a file"),
                ("write", "Write a file with a very long description that will not fit"),
            ],
        )];
        // First line is 24 chars; leave room for a partial second line.
        let budget = 24 + 1 + 30;
        let output = assemble_lines(&lean_entries(&manifests), budget);

        assert!(output.starts_with("files/read — Read a file\nfiles/write — "));
        assert!(output.ends_with('…'));
        assert_eq!(output.chars().count(), budget);
    }

    #[test]
    fn summary_omits_lines_that_cannot_keep_their_address() {
        let manifests = vec![manifest(
            "files",
            &[("read", "Read a file"), ("write", "Write a file")],
        )];
        // Room for the first line plus a couple of chars: not enough to
        // keep the second address, so the second line disappears.
        let output = assemble_lines(&lean_entries(&manifests), 24 + 1 + 4);
        assert_eq!(output, "files/read — Read a file");
    }

    #[test]
    fn summary_respects_budget_exactly_at_line_boundary() {
        let manifests = vec![manifest("files", &[("read", "Read a file")])];
        let line_len = "files/read — Read a file".chars().count();
        assert_eq!(
            assemble_lines(&lean_entries(&manifests), line_len),
            "files/read — Read a file"
        );
        assert_eq!(assemble_lines(&lean_entries(&manifests), 5), "");
    }

    #[test]
    fn empty_manifests_render_empty_summary() {
        assert_eq!(assemble_lines(&lean_entries(&[]), 100), "");
    }

    #[tokio::test]
    async fn prompt_fragment_wraps_summary_in_framing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = ManifestRegistry::new(test_pool(&["files"]), dir.path().to_path_buf());
        registry
            .persist(&manifest("files", &[("read", "Read a file")]))
            .expect("persist");
        registry.load_all().await;

        let fragment = registry.prompt_fragment(500).await;
        let lines: Vec<&str> = fragment.lines().collect();
        assert_eq!(lines.first(), Some(&SUMMARY_HEADER));
        assert_eq!(lines.last(), Some(&SUMMARY_FOOTER));
        assert!(fragment.contains("files/read — Read a file"));
        assert!(fragment.chars().count() <= 500);

        assert_eq!(registry.prompt_fragment(10).await, "");
    }

    #[tokio::test]
    async fn load_all_primes_cache_and_tolerates_corruption() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = test_pool(&["files", "web"]);
        let registry = ManifestRegistry::new(pool.clone(), dir.path().to_path_buf());
        registry
            .persist(&manifest("files", &[("read", "Read a file")]))
            .expect("persist");
        fs::write(dir.path().join("web.json"), "{ not json").expect("write corrupt");

        let fresh = ManifestRegistry::new(pool, dir.path().to_path_buf());
        fresh.load_all().await;

        assert!(fresh.manifest("files").await.is_some());
        assert!(fresh.manifest("web").await.is_none());
        assert_eq!(fresh.availability("files").await, Availability::Discovered);
        assert_eq!(fresh.availability("web").await, Availability::Undiscovered);
    }

    #[tokio::test]
    async fn unknown_server_cannot_be_discovered() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = ManifestRegistry::new(test_pool(&["files"]), dir.path().to_path_buf());
        let result = registry.discover("ghost").await;
        assert!(matches!(
            result,
            Err(RegistryError::UnknownServer { server }) if server == "ghost"
        ));
    }

    #[tokio::test]
    async fn describe_renders_cached_descriptor() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = ManifestRegistry::new(test_pool(&["files"]), dir.path().to_path_buf());
        registry
            .persist(&manifest("files", &[("read", "Read a file")]))
            .expect("persist");
        registry.load_all().await;

        let text = registry.describe("files", "read").await.expect("descriptor");
        assert!(text.starts_with("Tool: files/read"));
        assert!(registry.describe("files", "ghost").await.is_none());
        assert!(registry.describe("ghost", "read").await.is_none());
    }

    #[tokio::test]
    async fn savings_report_sums_servers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = ManifestRegistry::new(test_pool(&["files"]), dir.path().to_path_buf());
        registry
            .persist(&manifest("files", &[("read", "Read a file")]))
            .expect("persist");
        registry.load_all().await;

        let report = registry.savings().await;
        assert_eq!(report.servers.len(), 1);
        assert_eq!(report.total_full(), report.servers[0].full_listing_tokens);
        assert_eq!(
            report.total_saved(),
            report.total_full() - report.total_lean()
        );
    }
}
