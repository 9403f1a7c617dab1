//! Hack-a-Dome Headless Sync Client
//!
//! Drives a wandering avatar against the sync server. Useful for soak tests
//! and for populating the venue while developing the browser client.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use dome_sync::client::{HeadlessScene, SyncClient};
use dome_sync::config::ClientConfig;
use dome_sync::protocol::Position;

/// How often the scripted avatar takes a step
const WANDER_INTERVAL: Duration = Duration::from_millis(400);

/// How often the visible remote avatars are logged
const REPORT_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,dome_sync=debug"));
    fmt().with_env_filter(filter).with_target(false).init();

    let config = ClientConfig::load().await?;
    info!(
        identity = %config.identity,
        url = %config.server_url,
        "Starting headless sync client"
    );

    let start = {
        let mut rng = rand::thread_rng();
        Position::new(rng.gen_range(5..20) as f64, rng.gen_range(5..20) as f64)
    };
    let scene = Arc::new(Mutex::new(HeadlessScene::new(start)));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Stand-in for the input layer
    let wander_scene = scene.clone();
    let mut wander_shutdown_rx = shutdown_tx.subscribe();
    let wander_handle = tokio::spawn(async move {
        let mut step = tokio::time::interval(WANDER_INTERVAL);
        let mut report = tokio::time::interval(REPORT_INTERVAL);
        loop {
            tokio::select! {
                _ = step.tick() => {
                    wander_scene.lock().wander(&mut rand::thread_rng());
                }
                _ = report.tick() => {
                    let remotes = wander_scene.lock().remote_ids();
                    info!(count = remotes.len(), remotes = ?remotes, "Visible avatars");
                }
                _ = wander_shutdown_rx.recv() => break,
            }
        }
    });

    let mut client = SyncClient::new(config, scene);
    let mut client_shutdown_rx = shutdown_tx.subscribe();
    let client_handle = tokio::spawn(async move { client.run(&mut client_shutdown_rx).await });

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, leaving the venue...");
    let _ = shutdown_tx.send(());

    client_handle.await??;
    let _ = wander_handle.await;

    Ok(())
}
