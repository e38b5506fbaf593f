pub mod bridge;
pub mod cli;
pub mod config;

pub use bridge::{
    Availability, ConduitError, InvocationOutcome, InvocationRecord, InvocationStatus, InvokeError,
    Manifest, RefreshOutcome, RegistryError, ToolBridge, ToolDescriptor,
};
pub use cli::{Cli, Command};
pub use config::{AppConfig, BridgeSettings, ServerConfig};

use serde_json::json;
use std::error::Error;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, fmt};

pub async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    init_tracing();
    info!("Starting gangway");
    debug!(config = ?cli.config, command = ?cli.command, "CLI arguments parsed");

    let config_path = cli.config.as_deref().map(Path::new);
    let config = AppConfig::load(config_path)?;
    if let Some(path) = config_path {
        info!(path = %path.display(), "Loaded configuration from file");
    } else {
        info!("Loaded configuration from default path");
    }

    let bridge = ToolBridge::new(&config);
    bridge.load_cached_manifests().await;

    let outcome = dispatch(&bridge, cli.command).await;
    bridge.shutdown().await;
    info!("Bridge run finished");
    outcome
}

async fn dispatch(bridge: &ToolBridge, command: Command) -> Result<(), Box<dyn Error>> {
    match command {
        Command::List => {
            let overview = bridge.overview().await;
            if overview.is_empty() {
                println!("No servers configured.");
            }
            for row in overview {
                let refreshed = row
                    .refreshed_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{:<20} {:<13} {:>3} tools  ~{} tokens saved  refreshed {}",
                    row.server, row.availability, row.tools, row.tokens_saved, refreshed
                );
            }
        }
        Command::Refresh {
            server: Some(server),
        } => {
            let outcome = bridge.refresh(&server).await?;
            print_refresh(&server, &outcome);
        }
        Command::Refresh { server: None } => {
            let results = bridge.refresh_all().await;
            let total = results.len();
            let mut failures = 0usize;
            for (server, result) in results {
                match result {
                    Ok(outcome) => print_refresh(&server, &outcome),
                    Err(err) => {
                        failures += 1;
                        println!("{server}: refresh failed: {err}");
                    }
                }
            }
            if failures > 0 {
                return Err(format!("{failures} of {total} servers failed to refresh").into());
            }
        }
        Command::Describe { address } => {
            println!("{}", bridge.describe(&address).await?);
        }
        Command::Summary { budget, framed } => {
            let text = if framed {
                bridge.prompt_fragment(budget).await
            } else {
                bridge.lean_summary(budget).await
            };
            if text.is_empty() {
                println!("(no tools discovered; run `gangway refresh` first)");
            } else {
                println!("{text}");
            }
        }
        Command::Invoke {
            address,
            args,
            timeout_secs,
        } => {
            let arguments: serde_json::Value = serde_json::from_str(&args)?;
            let timeout = timeout_secs.map(Duration::from_secs);
            let outcome = bridge.invoke(&address, arguments, timeout).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "status": outcome.status,
                    "synopsis": outcome.synopsis,
                    "pointer": outcome.pointer,
                    "duration_ms": outcome.duration_ms,
                }))?
            );
        }
        Command::Result { pointer } => {
            let record = bridge.fetch_full(&pointer)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::Savings => {
            let report = bridge.savings().await;
            if report.servers.is_empty() {
                println!("No cached catalogues.");
            } else {
                for entry in &report.servers {
                    println!(
                        "{:<20} {:>3} tools  {:>8} -> {:>6} tokens  ({:.1}% saved)",
                        entry.server,
                        entry.tools,
                        entry.full_listing_tokens,
                        entry.lean_tokens,
                        entry.savings_pct()
                    );
                }
                println!(
                    "total: {} -> {} tokens, ~{} saved ({:.1}%)",
                    report.total_full(),
                    report.total_lean(),
                    report.total_saved(),
                    report.total_pct()
                );
            }
        }
    }
    Ok(())
}

fn print_refresh(server: &str, outcome: &RefreshOutcome) {
    match outcome {
        RefreshOutcome::Updated { tools } => {
            println!("{server}: catalogue updated ({tools} tools)");
        }
        RefreshOutcome::Unchanged { tools } => {
            println!("{server}: catalogue unchanged ({tools} tools)");
        }
    }
}

// Command output goes to stdout, so the log stream stays on stderr.
fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_level(true)
            .with_writer(std::io::stderr)
            .init();
    });
}
