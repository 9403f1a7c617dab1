//! Hack-a-Dome Presence Sync Server
//!
//! WebSocket server that collects avatar positions from browser clients and
//! hands back the shared presence snapshot.

use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use dome_sync::config::ServerConfig;
use dome_sync::net::listener;
use dome_sync::state::AppState;
use dome_sync::world::PresenceSweeper;
use dome_sync::VERSION;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Hack-a-Dome presence sync server v{}", VERSION);

    let config = ServerConfig::load().await?;
    info!(
        "Configuration loaded from: {}",
        config.config_path.display()
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let state = Arc::new(AppState::new(config, shutdown_tx.clone()));

    // Stale presence sweeper
    let sweeper_handle = PresenceSweeper::from_config(&state.config).map(|sweeper| {
        let sweeper_state = state.clone();
        let mut sweeper_shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            sweeper
                .run(&sweeper_state, &mut sweeper_shutdown_rx)
                .await;
        })
    });
    if sweeper_handle.is_none() {
        info!("Presence TTL disabled; entries only leave on request or disconnect");
    }

    let ws_listener = listener::bind(&state).await?;

    let ws_state = state.clone();
    let mut ws_shutdown_rx = shutdown_tx.subscribe();
    let ws_handle = tokio::spawn(async move {
        listener::accept_connections(ws_listener, ws_state, &mut ws_shutdown_rx).await;
    });

    info!("Server startup complete!");

    wait_for_shutdown(shutdown_tx.clone()).await;

    info!("Shutting down server...");

    // Returns once every connection handler has closed and released
    let _ = ws_handle.await;
    if let Some(handle) = sweeper_handle {
        let _ = handle.await;
    }

    state.sessions.disconnect_all();
    info!("All sessions disconnected");

    info!("Server shutdown complete. Goodbye!");
    Ok(())
}

/// Initialize the logging/tracing system
fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,dome_sync=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .init();
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn wait_for_shutdown(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    // Signal all tasks to shut down
    let _ = shutdown_tx.send(());
}
