//! Client sync agent module
//!
//! - `agent` - send throttling and snapshot reconciliation
//! - `scene` - boundary to the rendering/input layer
//! - `backoff` - reconnect delays
//! - `connection` - reconnecting WebSocket driver

pub mod agent;
pub mod backoff;
pub mod connection;
pub mod scene;

pub use agent::{ReconcileReport, SyncAgent};
pub use backoff::Backoff;
pub use connection::{SessionEnd, SyncClient};
pub use scene::{AvatarScene, HeadlessScene};
