use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use switchboard_relay::cli::Cli;
use switchboard_relay::config::Config;
use switchboard_relay::{serve, RelayState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().with_bind(cli.bind);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    tracing::info!(target: "switchboard::relay", addr = %config.bind, "relay listening");

    serve(listener, RelayState::new())
        .await
        .context("relay server failed")
}
