//! ridged — Ridge node daemon.
//!
//! Usage: `ridged controller` or `ridged server`.

use std::net::SocketAddr;

use anyhow::{Context, Result};

use ridge_core::config::RidgeConfig;
use ridged::{Controller, Server};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let role = std::env::args().nth(1).unwrap_or_default();
    if role != "controller" && role != "server" {
        eprintln!("usage: ridged <controller|server>");
        std::process::exit(2);
    }

    // Load config
    if let Err(e) = RidgeConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = RidgeConfig::load().context("failed to load config")?;
    config.validate().context("invalid config")?;
    tracing::info!(role, path = %RidgeConfig::file_path().display(), "ridged starting");

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    if role == "controller" {
        let addr = SocketAddr::new(
            config.network.listen_addr.ip(),
            config.network.controller_addr.port(),
        );
        Controller::bind(addr, &config, shutdown_tx.subscribe())
            .await?
            .run()
            .await?;
    } else {
        Server::bind(&config, shutdown_tx.subscribe())
            .await?
            .run()
            .await?;
    }

    tracing::info!("ridged stopped");
    Ok(())
}
