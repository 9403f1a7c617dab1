//! Session management module
//!
//! Manages client sessions including:
//! - Session lifecycle (creation, tracking, cleanup)
//! - Identities each connection has declared
//! - Per-connection outbound channel
//! - Thread-safe connection registry used for fan-out

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::error::{DomeError, NetworkError, PresenceError, Result};

/// Unique session identifier
pub type SessionId = u64;

/// A connected client session
pub struct Session {
    /// Unique session identifier
    pub id: SessionId,
    /// Remote address of the client
    pub address: SocketAddr,
    /// Time of last inbound frame
    last_activity: RwLock<Instant>,
    /// Time of last accepted frame (rate limiting)
    last_accepted: RwLock<Option<Instant>>,
    /// Identity this connection is bound to, when binding is enabled
    bound_identity: RwLock<Option<String>>,
    /// Identities this connection has published positions for
    declared: RwLock<HashSet<String>>,
    /// Outbound text frames
    outbound_tx: mpsc::Sender<String>,
}

impl Session {
    /// Create a new session
    pub fn new(id: SessionId, address: SocketAddr, outbound_tx: mpsc::Sender<String>) -> Self {
        let now = Instant::now();
        Self {
            id,
            address,
            last_activity: RwLock::new(now),
            last_accepted: RwLock::new(None),
            bound_identity: RwLock::new(None),
            declared: RwLock::new(HashSet::new()),
            outbound_tx,
        }
    }

    /// Get the IP address as a string (without port)
    pub fn ip(&self) -> String {
        self.address.ip().to_string()
    }

    /// Update the last activity timestamp
    pub fn touch(&self) {
        *self.last_activity.write() = Instant::now();
    }

    /// Get the last activity time
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.read()
    }

    /// Get the duration since last activity
    pub fn idle_duration(&self) -> Duration {
        self.last_activity().elapsed()
    }

    /// Record a frame at `now` unless the previous accepted frame is closer
    /// than `min_interval`.
    pub fn accept_frame(&self, min_interval: Option<Duration>, now: Instant) -> bool {
        let mut last = self.last_accepted.write();
        if let (Some(min), Some(prev)) = (min_interval, *last) {
            if now.saturating_duration_since(prev) < min {
                return false;
            }
        }
        *last = Some(now);
        true
    }

    /// Bind the session to `id` if unbound, otherwise require a match
    pub fn bind_identity(&self, id: &str) -> std::result::Result<(), PresenceError> {
        let mut bound = self.bound_identity.write();
        match bound.as_deref() {
            Some(existing) if existing != id => Err(PresenceError::IdentityMismatch {
                bound: existing.to_string(),
                declared: id.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                debug!(session_id = self.id, identity = %id, "Session bound to identity");
                *bound = Some(id.to_string());
                Ok(())
            }
        }
    }

    /// Require `id` to match the bound identity, if any
    pub fn verify_identity(&self, id: &str) -> std::result::Result<(), PresenceError> {
        match self.bound_identity.read().as_deref() {
            Some(existing) if existing != id => Err(PresenceError::IdentityMismatch {
                bound: existing.to_string(),
                declared: id.to_string(),
            }),
            _ => Ok(()),
        }
    }

    pub fn bound_identity(&self) -> Option<String> {
        self.bound_identity.read().clone()
    }

    /// Remember that this connection publishes positions for `id`.
    ///
    /// Returns true when `id` was not declared before.
    pub fn declare(&self, id: &str) -> bool {
        if self.declared.read().contains(id) {
            return false;
        }
        self.declared.write().insert(id.to_string())
    }

    /// Forget `id` after it left
    pub fn forget(&self, id: &str) {
        self.declared.write().remove(id);
    }

    pub fn has_declared(&self, id: &str) -> bool {
        self.declared.read().contains(id)
    }

    pub fn declared_identities(&self) -> Vec<String> {
        self.declared.read().iter().cloned().collect()
    }

    /// Queue a frame, waiting for room in the outbound buffer
    pub async fn send(&self, text: String) -> Result<()> {
        self.outbound_tx
            .send(text)
            .await
            .map_err(|_| DomeError::Network(NetworkError::ConnectionClosed))
    }

    /// Queue a frame without waiting
    pub fn try_send(&self, text: String) -> Result<()> {
        self.outbound_tx.try_send(text).map_err(|e| match e {
            TrySendError::Full(_) => DomeError::Network(NetworkError::WriteBufferFull),
            TrySendError::Closed(_) => DomeError::Network(NetworkError::ConnectionClosed),
        })
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("bound_identity", &self.bound_identity())
            .field("declared", &self.declared.read().len())
            .field("idle_duration", &self.idle_duration())
            .finish()
    }
}

/// Thread-safe connection registry
pub struct SessionManager {
    /// Map of session ID to session
    sessions: DashMap<SessionId, Arc<Session>>,
    /// Map of IP address to list of session IDs (for connection limiting)
    ip_to_sessions: DashMap<String, Vec<SessionId>>,
    /// Next session ID to assign
    next_id: AtomicU64,
    /// Maximum sessions per IP
    max_per_ip: usize,
}

impl SessionManager {
    /// Create a new session manager
    pub fn new() -> Self {
        Self::with_limit(64)
    }

    /// Create a session manager with a custom per-IP limit
    pub fn with_limit(max_per_ip: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            ip_to_sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
            max_per_ip,
        }
    }

    /// Create a session with an outbound channel and register it
    pub fn create_session(
        &self,
        address: SocketAddr,
        outbound_tx: mpsc::Sender<String>,
    ) -> Result<Arc<Session>> {
        let ip = address.ip().to_string();

        // Check and reserve under the IP entry lock
        let mut ip_sessions = self.ip_to_sessions.entry(ip.clone()).or_default();
        if ip_sessions.len() >= self.max_per_ip {
            warn!(
                ip = %ip,
                count = ip_sessions.len(),
                max = self.max_per_ip,
                "Connection limit exceeded for IP"
            );
            return Err(DomeError::Network(NetworkError::TooManyConnections(ip)));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(Session::new(id, address, outbound_tx));

        ip_sessions.push(id);
        drop(ip_sessions);
        self.sessions.insert(id, session.clone());

        info!(session_id = id, address = %address, "Session created");

        Ok(session)
    }

    /// Get a session by ID
    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|r| r.clone())
    }

    /// Remove a session
    pub fn remove(&self, id: SessionId) {
        if let Some((_, session)) = self.sessions.remove(&id) {
            let ip = session.ip();
            if let Some(mut sessions) = self.ip_to_sessions.get_mut(&ip) {
                sessions.retain(|&sid| sid != id);
            }
            self.ip_to_sessions.remove_if(&ip, |_, v| v.is_empty());

            info!(
                session_id = id,
                identities = ?session.declared_identities(),
                "Session removed"
            );
        }
    }

    /// Whether an open session other than `except` has declared `identity`
    pub fn identity_claimed_elsewhere(&self, identity: &str, except: SessionId) -> bool {
        self.sessions
            .iter()
            .any(|s| s.id != except && s.has_declared(identity))
    }

    /// Queue `text` on every open session, returning how many accepted it.
    ///
    /// Never waits: a session whose buffer is full misses this frame.
    pub fn broadcast(&self, text: &str) -> usize {
        let mut delivered = 0;
        for session in self.sessions.iter() {
            match session.try_send(text.to_string()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!(session_id = session.id, error = %e, "Dropped broadcast frame");
                }
            }
        }
        delivered
    }

    /// Drop every session from the registry
    pub fn disconnect_all(&self) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|r| *r.key()).collect();
        for id in ids {
            self.remove(id);
        }
    }

    /// Get the count of open sessions
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Get sessions from a specific IP
    pub fn sessions_from_ip(&self, ip: &str) -> Vec<Arc<Session>> {
        self.ip_to_sessions
            .get(ip)
            .map(|ids| ids.iter().filter_map(|&id| self.get(id)).collect())
            .unwrap_or_default()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_address() -> SocketAddr {
        "127.0.0.1:12345".parse().unwrap()
    }

    fn channel() -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
        mpsc::channel(4)
    }

    #[test]
    fn test_session_creation() {
        let (tx, _rx) = channel();
        let session = Session::new(1, test_address(), tx);
        assert_eq!(session.id, 1);
        assert_eq!(session.ip(), "127.0.0.1");
        assert!(session.bound_identity().is_none());
        assert!(session.declared_identities().is_empty());
    }

    #[test]
    fn test_session_touch() {
        let (tx, _rx) = channel();
        let session = Session::new(1, test_address(), tx);
        let initial = session.last_activity();

        std::thread::sleep(Duration::from_millis(10));
        session.touch();

        assert!(session.last_activity() > initial);
    }

    #[test]
    fn test_identity_binding() {
        let (tx, _rx) = channel();
        let session = Session::new(1, test_address(), tx);

        assert!(session.verify_identity("anyone").is_ok());
        assert!(session.bind_identity("alice").is_ok());
        assert!(session.bind_identity("alice").is_ok());
        assert_eq!(
            session.bind_identity("mallory"),
            Err(PresenceError::IdentityMismatch {
                bound: "alice".to_string(),
                declared: "mallory".to_string(),
            })
        );
        assert!(session.verify_identity("mallory").is_err());
        assert_eq!(session.bound_identity().as_deref(), Some("alice"));
    }

    #[test]
    fn test_accept_frame_rate_limit() {
        let (tx, _rx) = channel();
        let session = Session::new(1, test_address(), tx);
        let start = Instant::now();
        let min = Some(Duration::from_millis(50));

        assert!(session.accept_frame(min, start));
        assert!(!session.accept_frame(min, start + Duration::from_millis(10)));
        assert!(session.accept_frame(min, start + Duration::from_millis(60)));

        // No limit configured
        assert!(session.accept_frame(None, start + Duration::from_millis(61)));
        assert!(session.accept_frame(None, start + Duration::from_millis(61)));
    }

    #[test]
    fn test_declared_identities() {
        let (tx, _rx) = channel();
        let session = Session::new(1, test_address(), tx);
        assert!(session.declare("alice"));
        assert!(!session.declare("alice"));
        assert!(session.declare("alt"));
        assert_eq!(session.declared_identities().len(), 2);

        session.forget("alt");
        assert!(session.has_declared("alice"));
        assert!(!session.has_declared("alt"));
    }

    #[tokio::test]
    async fn test_session_send() {
        let (tx, mut rx) = channel();
        let session = Session::new(1, test_address(), tx);

        session.send("hello".to_string()).await.unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("hello"));

        drop(rx);
        assert!(session.send("gone".to_string()).await.is_err());
    }

    #[test]
    fn test_try_send_full_buffer() {
        let (tx, _rx) = mpsc::channel(1);
        let session = Session::new(1, test_address(), tx);

        assert!(session.try_send("one".to_string()).is_ok());
        let err = session.try_send("two".to_string()).unwrap_err();
        assert!(matches!(
            err,
            DomeError::Network(NetworkError::WriteBufferFull)
        ));
    }

    #[test]
    fn test_session_manager_create_and_remove() {
        let manager = SessionManager::new();
        let (tx, _rx) = channel();
        let session = manager.create_session(test_address(), tx).unwrap();
        let id = session.id;

        assert_eq!(manager.count(), 1);
        assert_eq!(manager.get(id).map(|s| s.id), Some(id));
        assert_eq!(manager.sessions_from_ip("127.0.0.1").len(), 1);

        manager.remove(id);

        assert!(manager.get(id).is_none());
        assert_eq!(manager.count(), 0);
        assert!(manager.sessions_from_ip("127.0.0.1").is_empty());
    }

    #[test]
    fn test_session_manager_ip_limit() {
        let manager = SessionManager::with_limit(2);
        let addr1: SocketAddr = "192.168.1.1:12345".parse().unwrap();
        let addr2: SocketAddr = "192.168.1.1:12346".parse().unwrap();
        let addr3: SocketAddr = "192.168.1.1:12347".parse().unwrap();
        let other: SocketAddr = "192.168.1.2:12345".parse().unwrap();

        assert!(manager.create_session(addr1, channel().0).is_ok());
        assert!(manager.create_session(addr2, channel().0).is_ok());
        assert!(manager.create_session(addr3, channel().0).is_err());
        assert!(manager.create_session(other, channel().0).is_ok());
    }

    #[test]
    fn test_identity_claimed_elsewhere() {
        let manager = SessionManager::new();
        let a = manager
            .create_session("127.0.0.1:1".parse().unwrap(), channel().0)
            .unwrap();
        let b = manager
            .create_session("127.0.0.1:2".parse().unwrap(), channel().0)
            .unwrap();

        a.declare("alice");
        assert!(!manager.identity_claimed_elsewhere("alice", a.id));
        assert!(manager.identity_claimed_elsewhere("alice", b.id));

        b.declare("alice");
        assert!(manager.identity_claimed_elsewhere("alice", a.id));
    }

    #[tokio::test]
    async fn test_broadcast() {
        let manager = SessionManager::new();
        let (tx1, mut rx1) = channel();
        let (tx2, mut rx2) = channel();
        manager
            .create_session("127.0.0.1:1".parse().unwrap(), tx1)
            .unwrap();
        manager
            .create_session("127.0.0.1:2".parse().unwrap(), tx2)
            .unwrap();

        assert_eq!(manager.broadcast("{}"), 2);
        assert_eq!(rx1.recv().await.as_deref(), Some("{}"));
        assert_eq!(rx2.recv().await.as_deref(), Some("{}"));

        drop(rx2);
        assert_eq!(manager.broadcast("{}"), 1);
    }
}
