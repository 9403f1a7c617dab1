//! Hack-a-Dome Presence Sync Library
//!
//! Real-time avatar position synchronization for the Hack-a-Dome venue: a
//! WebSocket server that keeps the shared presence snapshot, and the client
//! agent that feeds it and reconciles remote avatars.
//!
//! ## Modules
//!
//! - `client` - Client sync agent and reconnecting connection driver
//! - `config` - Server and client configuration management
//! - `error` - Error types and result definitions
//! - `net` - WebSocket listener, connection handling and session registry
//! - `protocol` - JSON wire protocol
//! - `world` - Presence store and stale-presence sweeper

pub mod client;
pub mod config;
pub mod error;
pub mod net;
pub mod protocol;
pub mod state;
pub mod world;

// Re-export commonly used types
pub use config::{BroadcastMode, ClientConfig, ServerConfig};
pub use error::{DomeError, Result};
pub use state::AppState;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
