//! Error handling module
//!
//! Defines custom error types for the presence sync server and client.

use std::io;

use thiserror::Error;

/// Main error type for the sync service
#[derive(Error, Debug)]
pub enum DomeError {
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Protocol-related errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Presence store errors
    #[error("Presence error: {0}")]
    Presence(#[from] PresenceError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DomeError {
    /// Whether this error only affects the frame that caused it.
    ///
    /// Frame-local errors are logged and the connection keeps running;
    /// anything else ends the connection.
    pub fn is_frame_local(&self) -> bool {
        matches!(
            self,
            DomeError::Protocol(_)
                | DomeError::Presence(_)
                | DomeError::Network(NetworkError::RateLimited)
        )
    }
}

/// Network-specific errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection timeout")]
    Timeout,

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Too many connections from {0}")]
    TooManyConnections(String),

    #[error("Write buffer full")]
    WriteBufferFull,

    #[error("Update rate limit exceeded")]
    RateLimited,
}

/// Protocol-specific errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Unsupported frame type: {0}")]
    UnsupportedFrame(&'static str),

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },
}

/// Presence store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PresenceError {
    #[error("Presence store full ({capacity} participants)")]
    CapacityExceeded { capacity: usize },

    #[error("Connection is bound to {bound}, refusing update for {declared}")]
    IdentityMismatch { bound: String, declared: String },
}

/// Result type alias for sync operations
pub type Result<T> = std::result::Result<T, DomeError>;
