//! Client connection driver
//!
//! Owns the socket lifecycle for a `SyncAgent`: connect, sample the scene on
//! every tick, apply snapshots as they arrive, and reconnect with backoff when
//! the socket drops. The protocol is stateless per frame, so a reconnect just
//! resumes sending.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

use crate::client::agent::SyncAgent;
use crate::client::backoff::Backoff;
use crate::client::scene::AvatarScene;
use crate::config::ClientConfig;
use crate::error::{DomeError, NetworkError, Result};
use crate::protocol::LeaveRequest;

fn ws_error(e: impl std::fmt::Display) -> DomeError {
    DomeError::Network(NetworkError::WebSocket(e.to_string()))
}

/// Why a connected session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Server closed the socket
    Closed,
    /// Local shutdown requested
    Shutdown,
}

/// Supervised, reconnecting sync client
pub struct SyncClient<S: AvatarScene> {
    config: ClientConfig,
    scene: Arc<Mutex<S>>,
    agent: SyncAgent,
    backoff: Backoff,
    /// Successful connections so far
    connections: u64,
}

impl<S: AvatarScene> SyncClient<S> {
    pub fn new(config: ClientConfig, scene: Arc<Mutex<S>>) -> Self {
        let agent = SyncAgent::new(config.identity.clone(), config.send_interval());
        let backoff = Backoff::new(
            Duration::from_millis(config.reconnect_base_ms),
            Duration::from_millis(config.reconnect_max_ms),
        );
        Self {
            config,
            scene,
            agent,
            backoff,
            connections: 0,
        }
    }

    pub fn connections(&self) -> u64 {
        self.connections
    }

    /// Run until shutdown, reconnecting whenever the socket drops
    pub async fn run(&mut self, shutdown_rx: &mut broadcast::Receiver<()>) -> Result<()> {
        info!(
            url = %self.config.server_url,
            identity = %self.agent.identity(),
            "Starting sync client"
        );

        loop {
            match self.run_session(shutdown_rx).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Closed) => {
                    info!(url = %self.config.server_url, "Sync server closed the connection");
                }
                Err(e) => {
                    warn!(
                        url = %self.config.server_url,
                        attempt = self.backoff.attempt(),
                        error = %e,
                        "Sync connection failed"
                    );
                }
            }

            let delay = self.backoff.next_delay();
            debug!(delay_ms = delay.as_millis() as u64, "Reconnecting after delay");

            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown_rx.recv() => break,
            }
        }

        info!(identity = %self.agent.identity(), "Sync client stopped");
        Ok(())
    }

    /// One connected session: returns when the socket ends or on shutdown
    pub async fn run_session(
        &mut self,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<SessionEnd> {
        let connect = connect_async(self.config.server_url.as_str());
        let (ws_stream, _) = tokio::select! {
            result = connect => result.map_err(ws_error)?,
            _ = shutdown_rx.recv() => return Ok(SessionEnd::Shutdown),
        };

        self.connections += 1;
        self.backoff.reset();
        self.agent.reset_throttle();
        info!(
            url = %self.config.server_url,
            identity = %self.agent.identity(),
            "Connected to sync server"
        );

        let (mut sink, mut stream) = ws_stream.split();
        let mut ticker = interval(self.config.tick_rate());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let local = self.scene.lock().local_position();
                    if let Some(update) = self.agent.poll_outbound(Instant::now(), local) {
                        let text = update
                            .to_json()
                            .map_err(|e| DomeError::Internal(e.to_string()))?;
                        sink.send(Message::Text(text)).await.map_err(ws_error)?;
                    }
                }
                message = stream.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => self.apply(&text),
                        Some(Ok(Message::Close(_))) | None => return Ok(SessionEnd::Closed),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(ws_error(e)),
                    }
                }
                _ = shutdown_rx.recv() => {
                    // Tell the server right away instead of waiting for eviction
                    let leave = LeaveRequest::new(self.agent.identity())
                        .to_json()
                        .map_err(|e| DomeError::Internal(e.to_string()))?;
                    let _ = sink.send(Message::Text(leave)).await;
                    let _ = sink.close().await;
                    return Ok(SessionEnd::Shutdown);
                }
            }
        }
    }

    fn apply(&mut self, text: &str) {
        let mut scene = self.scene.lock();
        match self.agent.handle_frame(text, &mut *scene) {
            Ok(report) => trace!(
                spawned = report.spawned,
                moved = report.moved,
                despawned = report.despawned,
                "Applied snapshot"
            ),
            Err(e) => warn!(error = %e, "Ignoring undecodable server frame"),
        }
    }
}
