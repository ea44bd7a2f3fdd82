//! # ScanLink Edge Agent
//!
//! Device process: loads configuration, starts the agent and feeds it one
//! scan per stdin line until SIGINT/SIGTERM.
//!
//! ## Usage
//! ```text
//! scanlink-agent [--config /etc/scanlink/scanlink.toml]
//!
//! SCANLINK_LOG=debug          log filter (falls back to RUST_LOG)
//! SCANLINK_HUB_URL=...        overrides [hub].url
//! SCANLINK_API_KEY=...        overrides [hub].api_key
//! ```
//!
//! Keyboard-wedge scanners terminate every scan with Enter, so a line on
//! stdin is one scan. A refused scan is reported on stderr immediately.

use anyhow::{bail, Context};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use scanlink_agent::{AgentBuilder, AgentConfig, AgentHandle};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config_path = parse_args()?;
    let config = AgentConfig::load(config_path).context("Configuration is not usable")?;
    let grace = config.shutdown_grace();
    info!(device = %config.device.name, hub = %config.hub_url(), "Configuration loaded");

    let handle = AgentBuilder::new(config)
        .build()
        .await
        .context("Failed to assemble agent")?
        .start()
        .await
        .context("Agent refused to start")?;

    tokio::select! {
        _ = capture_stdin(&handle) => {
            // Input closed; keep delivering the backlog until told to stop
            shutdown_signal().await;
        }
        _ = shutdown_signal() => {}
    }

    match handle.status().await {
        Ok(status) => info!(
            pending = status.pending_count,
            failed = status.failed_permanent_count,
            state = %status.registration_state,
            "Final status"
        ),
        Err(e) => warn!(?e, "Could not read final status"),
    }

    handle.shutdown(grace).await;
    Ok(())
}

/// Initializes the tracing subscriber.
///
/// ## Log Levels
/// - `SCANLINK_LOG=debug` - Show debug messages
/// - `SCANLINK_LOG=scanlink_agent=trace` - Trace the agent crate only
/// - Default: `info,sqlx=warn`
fn init_tracing() {
    let filter = EnvFilter::try_from_env("SCANLINK_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn parse_args() -> anyhow::Result<Option<PathBuf>> {
    let mut args = std::env::args().skip(1);
    let mut config_path = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = args.next().context("--config needs a path")?;
                config_path = Some(PathBuf::from(path));
            }
            other => bail!("Unknown argument: {}", other),
        }
    }
    Ok(config_path)
}

/// Reads scans from stdin until EOF.
async fn capture_stdin(handle: &AgentHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                let receipt = handle.capture(&line).await;
                if !receipt.accepted {
                    eprintln!(
                        "scan not stored: {}",
                        receipt.rejection.as_deref().unwrap_or("unknown error")
                    );
                }
            }
            Ok(None) => {
                info!("Capture input closed");
                return;
            }
            Err(e) => {
                error!(?e, "Reading capture input failed");
                return;
            }
        }
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(?e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(?e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, stopping agent");
}
