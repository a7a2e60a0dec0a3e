//! Delphi debugger bridge - command-line entry point.
//!
//! `serve` exposes the debugger tools on stdio; `peer` runs the reference
//! plugin implementation so the bridge can be exercised without an IDE.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::io::BufReader;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use delphi_debugger::config::{PeerConfig, RpcConfig, DEFAULT_HOST, DEFAULT_PORT};
use delphi_debugger::peer::MockPeer;
use delphi_debugger::tools::{serve_lines, DebuggerTools};

#[derive(Debug, Parser)]
#[command(name = "delphi-debugger", version, about = "RAD Studio debugger bridge")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve debugger tools as JSON lines on stdin/stdout
    Serve(ServeArgs),
    /// Run the reference debugger plugin
    Peer(PeerArgs),
}

#[derive(Debug, Args)]
struct ServeArgs {
    /// Plugin host (overrides RAD_PLUGIN_HOST)
    #[arg(long)]
    host: Option<String>,
    /// Plugin port (overrides RAD_PLUGIN_PORT)
    #[arg(long)]
    port: Option<u16>,
    /// Shared secret for the plugin (overrides RAD_PLUGIN_TOKEN)
    #[arg(long)]
    token: Option<String>,
    /// Per-call timeout in seconds (at least 1)
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    timeout_secs: Option<u64>,
    /// Log plugin events instead of buffering them for poll_events
    #[arg(long)]
    log_events: bool,
}

#[derive(Debug, Args)]
struct PeerArgs {
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Require this secret in the handshake
    #[arg(long)]
    token: Option<String>,
    /// Delay before the simulated breakpoint stop
    #[arg(long, default_value_t = 100)]
    stop_delay_ms: u64,
}

impl ServeArgs {
    fn into_config(self) -> Result<RpcConfig> {
        let mut config = RpcConfig::from_env().context("Invalid plugin configuration")?;
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(token) = self.token {
            config.token = Some(token);
        }
        if let Some(secs) = self.timeout_secs {
            config.timeout = Duration::from_secs(secs);
        }
        config.log_events |= self.log_events;
        Ok(config)
    }
}

impl PeerArgs {
    fn into_config(self) -> PeerConfig {
        PeerConfig {
            host: self.host,
            port: self.port,
            token: self.token,
            stop_delay: Duration::from_millis(self.stop_delay_ms),
        }
    }
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let config = args.into_config()?;
    info!(address = %config.address(), handshake = config.token.is_some(), "Serving debugger tools on stdio");

    let tools = DebuggerTools::new(config);
    let result = serve_lines(&tools, BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await;
    // Close on every exit path, including a failed read or write.
    tools.shutdown().await;
    result
}

async fn run_peer(args: PeerArgs) -> Result<()> {
    let peer = MockPeer::bind(args.into_config()).await?;
    info!(address = %peer.local_addr()?, "Reference peer listening");

    tokio::select! {
        _ = peer.serve() => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            info!("Reference peer shutting down");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries tool replies.
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "delphi_debugger=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    info!("Starting delphi-debugger v{}", env!("CARGO_PKG_VERSION"));

    match Cli::parse().command {
        Command::Serve(args) => run_serve(args).await,
        Command::Peer(args) => run_peer(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_timeout_flag_is_rejected() {
        assert!(Cli::try_parse_from(["delphi-debugger", "serve", "--timeout-secs", "0"]).is_err());

        let cli = Cli::try_parse_from(["delphi-debugger", "serve", "--timeout-secs", "5"]).unwrap();
        match cli.command {
            Command::Serve(args) => assert_eq!(args.timeout_secs, Some(5)),
            Command::Peer(_) => panic!("Expected serve"),
        }
    }
}
