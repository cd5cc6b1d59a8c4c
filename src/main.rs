//! Typerace Server
//!
//! WebSocket front end for the typing-race engine.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use typerace::network::{RaceServer, ServerConfig};
use typerace::{StaticPrompts, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let config = ServerConfig::from_env();

    info!("Typerace Server v{}", VERSION);
    info!(
        "Lobby capacity: {}, countdown tick: {:?}",
        config.manager.lobby_capacity, config.manager.countdown_tick
    );

    let server = Arc::new(RaceServer::new(config, Arc::new(StaticPrompts::default())));

    let signal_server = server.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, shutting down");
                signal_server.shutdown();
            }
            Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    server.run().await.context("Race server failed")?;

    info!("Server stopped");
    Ok(())
}
