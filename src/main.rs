use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;

mod aggregator;
mod alert;
mod api;
mod checks;
mod config;
mod engine;
mod escalation;
mod handlers;
mod models;
mod remote;

use crate::alert::HttpRelay;
use crate::config::MonitorConfig;
use crate::engine::Monitor;
use crate::remote::SshShell;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::INFO.into()))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("FLEETWATCH_CONFIG").ok())
        .unwrap_or_else(|| "config.toml".into());
    let config = MonitorConfig::load(&config_path)
        .with_context(|| format!("Failed to load {}", config_path))?;
    let config = Arc::new(config);

    let timeout = Duration::from_secs(config.connect_timeout_secs);
    let transport = Arc::new(HttpRelay::new(config.alert_url.clone(), timeout).context("Failed to build alert client")?);
    let shell = Arc::new(SshShell::new(timeout));

    let monitor = Arc::new(Monitor::new(config.clone(), shell, transport));

    let api_port = config.api_port;
    let snapshot_path = PathBuf::from(&config.snapshot_path);
    tokio::spawn(async move {
        if let Err(e) = api::start_server(api_port, snapshot_path).await {
            tracing::error!("Results API failed: {}", e);
        }
    });

    tokio::spawn(Arc::clone(&monitor).run());

    signal::ctrl_c().await?;
    info!("Shutdown signal received. Stopping monitor...");

    Ok(())
}
