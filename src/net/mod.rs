//! Networking module
//!
//! This module handles the server side of the sync channel:
//! - Accepting WebSocket connections
//! - Per-connection frame handling
//! - Session management and the connection registry

pub mod handler;
pub mod listener;
pub mod session;
