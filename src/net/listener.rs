//! Listener module
//!
//! Binds the sync port and spawns a `ConnectionHandler` task per accepted
//! socket. A failing connection only ends its own task. On shutdown the
//! acceptor waits for its handlers to close their sockets and release their
//! identities before returning.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::net::handler::ConnectionHandler;
use crate::state::AppState;

/// How long open connections get to wind down after the shutdown signal
const HANDLER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Bind the WebSocket listener described by the config
pub async fn bind(state: &AppState) -> Result<TcpListener> {
    let listener = TcpListener::bind(state.config.listen_address()).await?;
    info!("WebSocket server listening on: {}", listener.local_addr()?);
    Ok(listener)
}

/// Accept incoming WebSocket connections until shutdown
pub async fn accept_connections(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown_rx: &mut broadcast::Receiver<()>,
) {
    let mut handlers = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        info!("New WebSocket connection from: {}", addr);
                        let handler = ConnectionHandler::new(state.clone());
                        handlers.spawn(async move {
                            if let Err(e) = handler.handle_websocket(stream, addr).await {
                                warn!("WebSocket connection error from {}: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept WebSocket connection: {}", e);
                    }
                }
            }
            // Reap finished handlers
            Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
            _ = shutdown_rx.recv() => {
                info!("WebSocket connection acceptor shutting down");
                break;
            }
        }
    }

    drop(listener);

    let open = handlers.len();
    if open == 0 {
        return;
    }
    debug!(open = open, "Waiting for connection handlers to finish");

    let drained = tokio::time::timeout(HANDLER_DRAIN_TIMEOUT, async {
        while handlers.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        warn!(
            remaining = handlers.len(),
            "Connection handlers did not finish in time, aborting"
        );
        handlers.abort_all();
    }
}
