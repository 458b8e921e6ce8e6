//! uplinkd: Uplink file transfer daemon.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};

use uplink_core::config::UplinkConfig;
use uplink_services::{LoggingAux, NodeIdentity, PeerDirectory, TransferManager};

mod link;
mod sweep;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = UplinkConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = UplinkConfig::load().context("failed to load config")?;
    tracing::info!(
        node_id = config.identity.node_id,
        node_name = %config.identity.node_name,
        root = %config.transfer.root.display(),
        peers = config.peers.len(),
        "uplinkd starting"
    );

    // Bind link socket
    let socket = Arc::new(link::bind(config.network.bind).context("failed to bind link socket")?);

    // Engine
    let peers = PeerDirectory::from_config(&config.peers);
    let manager = Arc::new(TransferManager::new(
        NodeIdentity {
            node_id: config.identity.node_id,
            node_name: config.identity.node_name.clone(),
        },
        config.transfer.clone(),
        peers,
        Arc::new(LoggingAux),
    ));
    let events = manager.subscribe();
    let resumed = manager
        .resume(Instant::now())
        .context("failed to resume from checkpoints")?;
    if resumed > 0 {
        tracing::info!(resumed, "resumed incoming transfers");
    }

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

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let receive_task = tokio::spawn(link::receive_loop(
        socket.clone(),
        manager.clone(),
        shutdown_tx.subscribe(),
    ));

    let sweep_task = tokio::spawn(sweep::sweep_loop(
        socket,
        manager.clone(),
        config.transfer.poll_interval(),
        shutdown_tx.subscribe(),
    ));

    let event_task = tokio::spawn(sweep::event_logger(events, shutdown_tx.subscribe()));

    tracing::info!("uplinkd running");

    tokio::select! {
        r = receive_task => tracing::info!("receive loop exited: {:?}", r),
        r = sweep_task   => tracing::info!("sweep loop exited: {:?}", r),
        r = event_task   => tracing::info!("event logger exited: {:?}", r),
    }

    // checkpoint anything still open
    manager.shutdown(Instant::now());
    Ok(())
}
