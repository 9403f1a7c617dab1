//! Connection handler module
//!
//! Handles the lifecycle of sync connections including:
//! - WebSocket handshake and session registration
//! - Decoding position/leave frames and applying them to the presence store
//! - Replying to the sender (echo) or pushing to everyone (fan-out)
//! - Releasing the session and its identities on disconnect
//!
//! Frame-level failures (bad JSON, rejected updates, rate limiting) only drop
//! the offending frame. Transport failures end this connection and nothing
//! else.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async_with_config, WebSocketStream};
use tracing::{debug, info, trace, warn};

use crate::config::BroadcastMode;
use crate::error::{DomeError, NetworkError, ProtocolError, Result};
use crate::net::session::Session;
use crate::protocol::{decode_client_frame, ClientFrame, MAX_FRAME_SIZE};
use crate::state::AppState;

/// How long the writer gets to flush queued frames after the reader ends
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

type WsReader = SplitStream<WebSocketStream<TcpStream>>;

/// Connection handler for processing sync connections
pub struct ConnectionHandler {
    /// Shared application state
    state: Arc<AppState>,
}

impl ConnectionHandler {
    /// Create a new connection handler
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Handle a WebSocket connection
    pub async fn handle_websocket(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        debug!(address = %addr, "Handling WebSocket connection");

        stream.set_nodelay(true)?;

        let ws_stream = accept_async_with_config(stream, Some(ws_config()))
            .await
            .map_err(|e| DomeError::Network(NetworkError::WebSocket(e.to_string())))?;

        info!(address = %addr, "WebSocket connection established");

        let (mut sink, mut reader) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) =
            mpsc::channel::<String>(self.state.config.outbound_buffer);

        let session = match self.state.sessions.create_session(addr, outbound_tx) {
            Ok(session) => session,
            Err(e) => {
                let _ = sink.close().await;
                return Err(e);
            }
        };
        let session_id = session.id;

        // Single writer per socket; replies and broadcasts both go through it
        let mut writer = tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    trace!(session_id = session_id, error = %e, "Outbound write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let result = self.process_connection(&mut reader, &session).await;

        self.release(&session);
        // Last sender goes away with the session, which lets the writer finish
        drop(session);

        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
            .await
            .is_err()
        {
            trace!(session_id = session_id, "Writer did not drain in time");
            writer.abort();
        }

        debug!(session_id = session_id, "Connection handler ending");
        result
    }

    /// Main frame loop
    async fn process_connection(&self, reader: &mut WsReader, session: &Session) -> Result<()> {
        let mut shutdown_rx = self.state.shutdown_tx.subscribe();
        let idle_timeout = self.state.config.idle_timeout();

        loop {
            let next = tokio::select! {
                next = next_message(reader, idle_timeout) => next,
                _ = shutdown_rx.recv() => {
                    debug!(session_id = session.id, "Closing session for shutdown");
                    break;
                }
            };

            let message = match next {
                Ok(Some(message)) => message,
                Ok(None) => {
                    debug!(session_id = session.id, "Connection closed");
                    break;
                }
                Err(DomeError::Network(NetworkError::Timeout)) => {
                    info!(
                        session_id = session.id,
                        idle = ?session.idle_duration(),
                        "Closing idle connection"
                    );
                    break;
                }
                Err(e) => {
                    warn!(session_id = session.id, error = %e, "Connection error");
                    break;
                }
            };

            let result = match message {
                Message::Text(text) => self.handle_frame(session, &text).await,
                Message::Binary(data) => match String::from_utf8(data) {
                    Ok(text) => self.handle_frame(session, &text).await,
                    Err(_) => Err(ProtocolError::UnsupportedFrame("binary").into()),
                },
                Message::Close(_) => {
                    debug!(session_id = session.id, "WebSocket close message received");
                    break;
                }
                // Pings are answered by tungstenite itself
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            };

            if let Err(e) = result {
                if e.is_frame_local() {
                    warn!(session_id = session.id, error = %e, "Dropped frame");
                    continue;
                }
                warn!(session_id = session.id, error = %e, "Ending connection");
                break;
            }
        }

        Ok(())
    }

    /// Apply one inbound text frame and publish the resulting snapshot
    pub async fn handle_frame(&self, session: &Session, text: &str) -> Result<()> {
        session.touch();

        let frame = decode_client_frame(text)?;

        if !session.accept_frame(self.state.config.min_update_interval(), Instant::now()) {
            return Err(NetworkError::RateLimited.into());
        }

        match frame {
            ClientFrame::Update(update) => {
                if self.state.config.bind_identity {
                    session.bind_identity(&update.id)?;
                }
                // Claim before writing: release only evicts unclaimed identities
                let newly_declared = session.declare(&update.id);
                let outcome = match self.state.presence.upsert(&update.id, update.position()) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        if newly_declared {
                            session.forget(&update.id);
                        }
                        return Err(e.into());
                    }
                };
                trace!(
                    session_id = session.id,
                    identity = %update.id,
                    outcome = ?outcome,
                    "Position accepted"
                );
            }
            ClientFrame::Leave(leave) => {
                session.verify_identity(&leave.leave)?;
                let removed = self.state.presence.remove(&leave.leave);
                session.forget(&leave.leave);
                info!(
                    session_id = session.id,
                    identity = %leave.leave,
                    removed = removed,
                    "Participant left"
                );
            }
        }

        self.publish(session).await
    }

    /// Send the current snapshot according to the broadcast mode
    async fn publish(&self, session: &Session) -> Result<()> {
        match self.state.config.broadcast_mode {
            BroadcastMode::Echo => {
                let text = self.state.encoded_snapshot()?;
                session.send(text).await
            }
            BroadcastMode::FanOut => {
                self.state.broadcast_snapshot()?;
                Ok(())
            }
        }
    }

    /// Unregister the session and evict identities nobody else holds
    fn release(&self, session: &Session) {
        self.state.sessions.remove(session.id);

        if !self.state.config.evict_on_disconnect {
            return;
        }

        let sessions = &self.state.sessions;
        let mut evicted = Vec::new();
        for identity in session.declared_identities() {
            let removed = self.state.presence.remove_unless(&identity, |id| {
                sessions.identity_claimed_elsewhere(id, session.id)
            });
            if removed {
                evicted.push(identity);
            }
        }

        if evicted.is_empty() {
            return;
        }

        info!(
            session_id = session.id,
            evicted = ?evicted,
            "Evicted identities of closed connection"
        );

        if self.state.config.broadcast_mode == BroadcastMode::FanOut {
            if let Err(e) = self.state.broadcast_snapshot() {
                warn!(error = %e, "Failed to broadcast snapshot after disconnect");
            }
        }
    }
}

/// Inbound limits: oversized messages fail in the reader instead of being
/// buffered in full
fn ws_config() -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(MAX_FRAME_SIZE),
        max_frame_size: Some(MAX_FRAME_SIZE),
        ..WebSocketConfig::default()
    }
}

/// Read the next WebSocket message, honouring the idle timeout
async fn next_message(reader: &mut WsReader, idle_timeout: Option<Duration>) -> Result<Option<Message>> {
    let next = match idle_timeout {
        Some(limit) => tokio::time::timeout(limit, reader.next())
            .await
            .map_err(|_| DomeError::Network(NetworkError::Timeout))?,
        None => reader.next().await,
    };

    match next {
        Some(Ok(message)) => Ok(Some(message)),
        Some(Err(e)) => Err(DomeError::Network(NetworkError::WebSocket(e.to_string()))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::protocol::{Position, Snapshot};
    use tokio::sync::broadcast;

    fn handler_with(config: ServerConfig) -> (ConnectionHandler, Arc<AppState>) {
        let (shutdown_tx, _) = broadcast::channel(1);
        let state = Arc::new(AppState::new(config, shutdown_tx));
        (ConnectionHandler::new(state.clone()), state)
    }

    fn register(state: &AppState, port: u16) -> (Arc<Session>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(8);
        let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
        (state.sessions.create_session(addr, tx).unwrap(), rx)
    }

    async fn next_snapshot(rx: &mut mpsc::Receiver<String>) -> Snapshot {
        Snapshot::from_json(&rx.recv().await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_update_echoes_snapshot_to_sender() {
        let (handler, state) = handler_with(ServerConfig::default());
        let (alice, mut alice_rx) = register(&state, 1);
        let (_bob, mut bob_rx) = register(&state, 2);

        handler
            .handle_frame(&alice, r#"{"id":"alice","x":10,"y":20}"#)
            .await
            .unwrap();

        let snapshot = next_snapshot(&mut alice_rx).await;
        assert_eq!(snapshot.get("alice"), Some(&Position::new(10.0, 20.0)));
        assert!(bob_rx.try_recv().is_err(), "echo mode must not reach peers");
    }

    #[tokio::test]
    async fn test_update_fans_out_to_everyone() {
        let config = ServerConfig {
            broadcast_mode: BroadcastMode::FanOut,
            ..ServerConfig::default()
        };
        let (handler, state) = handler_with(config);
        let (alice, mut alice_rx) = register(&state, 1);
        let (_bob, mut bob_rx) = register(&state, 2);

        handler
            .handle_frame(&alice, r#"{"id":"alice","x":1,"y":2}"#)
            .await
            .unwrap();

        assert!(next_snapshot(&mut alice_rx).await.contains("alice"));
        assert!(next_snapshot(&mut bob_rx).await.contains("alice"));
    }

    #[tokio::test]
    async fn test_malformed_frame_is_frame_local() {
        let (handler, state) = handler_with(ServerConfig::default());
        let (alice, mut alice_rx) = register(&state, 1);

        let err = handler
            .handle_frame(&alice, r#"{"id":"alice","x":1}"#)
            .await
            .unwrap_err();
        assert!(err.is_frame_local());
        assert!(alice_rx.try_recv().is_err(), "no reply for a bad frame");
        assert!(state.presence.is_empty());

        handler
            .handle_frame(&alice, r#"{"id":"alice","x":1,"y":1}"#)
            .await
            .unwrap();
        assert!(next_snapshot(&mut alice_rx).await.contains("alice"));
    }

    #[tokio::test]
    async fn test_leave_removes_identity() {
        let (handler, state) = handler_with(ServerConfig::default());
        let (alice, mut alice_rx) = register(&state, 1);

        handler
            .handle_frame(&alice, r#"{"id":"alice","x":1,"y":1}"#)
            .await
            .unwrap();
        next_snapshot(&mut alice_rx).await;

        handler.handle_frame(&alice, r#"{"leave":"alice"}"#).await.unwrap();
        assert!(next_snapshot(&mut alice_rx).await.is_empty());
        assert!(!alice.has_declared("alice"));

        // Leaving twice is harmless
        handler.handle_frame(&alice, r#"{"leave":"alice"}"#).await.unwrap();
    }

    #[tokio::test]
    async fn test_bound_identity_rejects_spoofing() {
        let config = ServerConfig {
            bind_identity: true,
            ..ServerConfig::default()
        };
        let (handler, state) = handler_with(config);
        let (conn, _rx) = register(&state, 1);

        handler
            .handle_frame(&conn, r#"{"id":"alice","x":1,"y":1}"#)
            .await
            .unwrap();

        let err = handler
            .handle_frame(&conn, r#"{"id":"bob","x":9,"y":9}"#)
            .await
            .unwrap_err();
        assert!(err.is_frame_local());
        assert!(!state.presence.contains("bob"));

        assert!(handler.handle_frame(&conn, r#"{"leave":"bob"}"#).await.is_err());
    }

    #[tokio::test]
    async fn test_rate_limit_drops_fast_frames() {
        let config = ServerConfig {
            min_update_interval_ms: 60_000,
            ..ServerConfig::default()
        };
        let (handler, state) = handler_with(config);
        let (conn, mut rx) = register(&state, 1);

        handler
            .handle_frame(&conn, r#"{"id":"alice","x":1,"y":1}"#)
            .await
            .unwrap();
        next_snapshot(&mut rx).await;

        let err = handler
            .handle_frame(&conn, r#"{"id":"alice","x":2,"y":2}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, DomeError::Network(NetworkError::RateLimited)));
        assert_eq!(state.presence.get("alice"), Some(Position::new(1.0, 1.0)));
    }

    #[tokio::test]
    async fn test_capacity_rejection_is_frame_local() {
        let config = ServerConfig {
            max_participants: 1,
            ..ServerConfig::default()
        };
        let (handler, state) = handler_with(config);
        let (conn, _rx) = register(&state, 1);

        handler
            .handle_frame(&conn, r#"{"id":"alice","x":1,"y":1}"#)
            .await
            .unwrap();
        let err = handler
            .handle_frame(&conn, r#"{"id":"bob","x":1,"y":1}"#)
            .await
            .unwrap_err();
        assert!(err.is_frame_local());
        assert!(!conn.has_declared("bob"));
    }

    #[tokio::test]
    async fn test_release_evicts_unclaimed_identities() {
        let (handler, state) = handler_with(ServerConfig::default());
        let (old, _old_rx) = register(&state, 1);
        let (new, _new_rx) = register(&state, 2);

        handler
            .handle_frame(&old, r#"{"id":"alice","x":1,"y":1}"#)
            .await
            .unwrap();
        handler
            .handle_frame(&old, r#"{"id":"ghost","x":1,"y":1}"#)
            .await
            .unwrap();
        // alice reconnected on another socket before the old one closed
        handler
            .handle_frame(&new, r#"{"id":"alice","x":2,"y":2}"#)
            .await
            .unwrap();

        handler.release(&old);

        assert!(state.sessions.get(old.id).is_none());
        assert!(state.presence.contains("alice"));
        assert!(!state.presence.contains("ghost"));
    }

    #[tokio::test]
    async fn test_release_spares_identity_claimed_mid_update() {
        let (handler, state) = handler_with(ServerConfig::default());
        let (old, _old_rx) = register(&state, 1);
        let (new, _new_rx) = register(&state, 2);

        handler
            .handle_frame(&old, r#"{"id":"alice","x":1,"y":1}"#)
            .await
            .unwrap();

        // The new socket has claimed alice but not yet written its position
        // when the old one closes
        assert!(new.declare("alice"));
        handler.release(&old);
        assert!(state.presence.contains("alice"));

        state.presence.upsert("alice", Position::new(2.0, 2.0)).unwrap();
        assert_eq!(state.presence.get("alice"), Some(Position::new(2.0, 2.0)));
    }

    #[tokio::test]
    async fn test_update_after_release_is_kept() {
        let (handler, state) = handler_with(ServerConfig::default());
        let (old, _old_rx) = register(&state, 1);
        let (new, mut new_rx) = register(&state, 2);

        handler
            .handle_frame(&old, r#"{"id":"alice","x":1,"y":1}"#)
            .await
            .unwrap();
        handler.release(&old);
        assert!(!state.presence.contains("alice"));

        handler
            .handle_frame(&new, r#"{"id":"alice","x":2,"y":2}"#)
            .await
            .unwrap();
        assert_eq!(
            next_snapshot(&mut new_rx).await.get("alice"),
            Some(&Position::new(2.0, 2.0))
        );
        assert!(new.has_declared("alice"));
    }

    #[tokio::test]
    async fn test_release_keeps_presence_when_eviction_disabled() {
        let config = ServerConfig {
            evict_on_disconnect: false,
            ..ServerConfig::default()
        };
        let (handler, state) = handler_with(config);
        let (conn, _rx) = register(&state, 1);

        handler
            .handle_frame(&conn, r#"{"id":"alice","x":1,"y":1}"#)
            .await
            .unwrap();
        handler.release(&conn);

        assert!(state.presence.contains("alice"));
    }
}
