//! Application state module
//!
//! Contains the shared state used across all server connections.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{info, trace};

use crate::config::ServerConfig;
use crate::error::{DomeError, Result};
use crate::net::session::SessionManager;
use crate::world::store::PresenceStore;

/// Application state shared across all connections
pub struct AppState {
    /// Server configuration
    pub config: ServerConfig,
    /// Authoritative identity -> position mapping
    pub presence: Arc<PresenceStore>,
    /// Registry of open connections
    pub sessions: SessionManager,
    /// Shutdown signal sender
    pub shutdown_tx: broadcast::Sender<()>,
    /// Orders fan-out pushes so no connection sees an older snapshot after a newer one
    publish_lock: Mutex<()>,
}

impl AppState {
    /// Create a new application state
    pub fn new(config: ServerConfig, shutdown_tx: broadcast::Sender<()>) -> Self {
        let presence = Arc::new(PresenceStore::with_capacity_limit(config.max_participants));
        let sessions = SessionManager::with_limit(config.max_connections_per_ip);

        info!(
            broadcast_mode = ?config.broadcast_mode,
            presence_ttl_secs = config.presence_ttl_secs,
            evict_on_disconnect = config.evict_on_disconnect,
            max_participants = config.max_participants,
            bind_identity = config.bind_identity,
            "Presence state initialized"
        );

        Self {
            config,
            presence,
            sessions,
            shutdown_tx,
            publish_lock: Mutex::new(()),
        }
    }

    /// Current snapshot encoded as a JSON text frame.
    ///
    /// The store lock is released before encoding.
    pub fn encoded_snapshot(&self) -> Result<String> {
        let snapshot = self.presence.snapshot();
        snapshot
            .to_json()
            .map_err(|e| DomeError::Internal(format!("snapshot encoding failed: {}", e)))
    }

    /// Push the current snapshot to every open connection.
    ///
    /// Taking the snapshot and queueing it happen under one lock, so every
    /// connection receives pushes in store order. Queueing never waits.
    pub fn broadcast_snapshot(&self) -> Result<usize> {
        let _publish = self.publish_lock.lock();
        let text = self.encoded_snapshot()?;
        let delivered = self.sessions.broadcast(&text);
        trace!(delivered = delivered, "Snapshot broadcast");
        Ok(delivered)
    }
}
