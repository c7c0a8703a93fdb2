//! RelayGuard - anti-spam decision engine entry point

use anyhow::Result;
use relayguard_common::Config;
use relayguard_core::{CommandServer, DnslistServer, Engine, PeerGossip, PolicyServer, SystemResolver};
use relayguard_storage::{AnalysisLog, SnapshotStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting RelayGuard...");

    // Load configuration
    let config = Config::load()?;

    // Storage
    let store = SnapshotStore::new(&config.storage.path)?;
    let analysis = AnalysisLog::new(&config.storage.analysis_path)?;

    // Assemble the engine and restore its snapshots
    let resolver = SystemResolver::new(&config.dns);
    let (engine, gossip_rx) = Engine::new(config.clone(), resolver, Some(store), Some(analysis));
    engine.load().await?;
    info!("Engine assembled, snapshots restored");

    // Peer gossip: one task pushes mutations out, one applies deltas in
    let gossip = PeerGossip::new(
        &config.peers.bind,
        &config.peers.peers,
        engine.reputation.clone(),
    )
    .await?;
    let gossip_dispatch = tokio::spawn(gossip.clone().run_dispatch(gossip_rx));
    let gossip_receive = tokio::spawn(gossip.run_receiver());

    // Command protocol
    let command_handle = {
        let server = CommandServer::new(engine.clone());
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Command server error: {}", e);
            }
        })
    };

    // Postfix policy protocol
    let policy_handle = {
        let server = PolicyServer::new(engine.clone());
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Policy server error: {}", e);
            }
        })
    };

    // DNS-list frontend
    let dnslist_handle = if config.dnslist.enabled {
        let server = Arc::new(DnslistServer::bind(engine.clone()).await?);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("DNS-list server error: {}", e);
            }
        }))
    } else {
        info!("DNS-list frontend disabled");
        None
    };

    // Background persistence
    let persist_handle = {
        let engine = engine.clone();
        let interval = Duration::from_secs(config.storage.persist_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                engine.save().await;
            }
        })
    };

    // Background SPF refresh
    let refresh_handle = {
        let engine = engine.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(3600));
            loop {
                ticker.tick().await;
                engine.refresh_cycle().await;
            }
        })
    };

    // Hourly expiry sweep
    let sweep_handle = {
        let engine = engine.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(3600));
            loop {
                ticker.tick().await;
                engine.sweep().await;
            }
        })
    };

    info!("RelayGuard started");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    command_handle.abort();
    policy_handle.abort();
    if let Some(handle) = dnslist_handle {
        handle.abort();
    }
    gossip_dispatch.abort();
    gossip_receive.abort();
    persist_handle.abort();
    refresh_handle.abort();
    sweep_handle.abort();

    // Final persistence pass before exit
    engine.save().await;

    info!("RelayGuard shutdown complete");

    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,relayguard=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_level(true))
        .with(filter)
        .init();
}
