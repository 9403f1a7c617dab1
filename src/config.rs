//! Configuration module
//!
//! Handles loading and parsing of server and client configuration from files
//! and environment variables.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// How accepted updates are published
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastMode {
    /// Reply with the snapshot on the sending connection only
    Echo,
    /// Push the snapshot to every open connection
    FanOut,
}

impl std::str::FromStr for BroadcastMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "echo" => Ok(BroadcastMode::Echo),
            "fan_out" | "fanout" | "fan-out" => Ok(BroadcastMode::FanOut),
            other => Err(format!("unknown broadcast mode: {}", other)),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Path to the configuration file
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Address to bind the listener on
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// WebSocket listen port
    #[serde(default = "default_websocket_port")]
    pub websocket_port: u16,

    /// Reply to the sender only, or fan out to everyone
    #[serde(default = "default_broadcast_mode")]
    pub broadcast_mode: BroadcastMode,

    /// Evict participants not heard from for this long (0 to disable)
    #[serde(default = "default_presence_ttl")]
    pub presence_ttl_secs: u64,

    /// How often the stale presence sweep runs
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Remove a connection's identities when it closes
    #[serde(default = "default_true")]
    pub evict_on_disconnect: bool,

    /// Maximum number of tracked participants (0 for unbounded)
    #[serde(default = "default_max_participants")]
    pub max_participants: usize,

    /// Close connections silent for this long (0 to disable)
    #[serde(default)]
    pub idle_timeout_secs: u64,

    /// Bind each connection to the first identity it declares
    #[serde(default)]
    pub bind_identity: bool,

    /// Minimum spacing between accepted frames of one connection (0 to disable)
    #[serde(default)]
    pub min_update_interval_ms: u64,

    /// Maximum concurrent connections per IP
    #[serde(default = "default_max_connections_per_ip")]
    pub max_connections_per_ip: usize,

    /// Outbound frames queued per connection before fan-out drops
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Path to the configuration file
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Sync server URL
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Participant identity (wallet address or session id)
    #[serde(default = "default_identity")]
    pub identity: String,

    /// Minimum spacing between position sends
    #[serde(default = "default_send_interval")]
    pub send_interval_ms: u64,

    /// Sampling tick
    #[serde(default = "default_tick_rate")]
    pub tick_rate_ms: u64,

    /// First reconnect delay
    #[serde(default = "default_reconnect_base")]
    pub reconnect_base_ms: u64,

    /// Reconnect delay ceiling
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_ms: u64,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_websocket_port() -> u16 {
    8080
}

fn default_broadcast_mode() -> BroadcastMode {
    BroadcastMode::Echo
}

fn default_presence_ttl() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_max_participants() -> usize {
    10_000
}

fn default_max_connections_per_ip() -> usize {
    64
}

fn default_outbound_buffer() -> usize {
    64
}

fn default_server_url() -> String {
    "ws://127.0.0.1:8080".to_string()
}

fn default_identity() -> String {
    format!("guest-{}", uuid::Uuid::new_v4().simple())
}

fn default_send_interval() -> u64 {
    100
}

fn default_tick_rate() -> u64 {
    16 // ~60 fps
}

fn default_reconnect_base() -> u64 {
    250
}

fn default_reconnect_max() -> u64 {
    10_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config/server.toml"),
            bind_address: default_bind_address(),
            websocket_port: default_websocket_port(),
            broadcast_mode: default_broadcast_mode(),
            presence_ttl_secs: default_presence_ttl(),
            sweep_interval_secs: default_sweep_interval(),
            evict_on_disconnect: default_true(),
            max_participants: default_max_participants(),
            idle_timeout_secs: 0,
            bind_identity: false,
            min_update_interval_ms: 0,
            max_connections_per_ip: default_max_connections_per_ip(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config/client.toml"),
            server_url: default_server_url(),
            identity: default_identity(),
            send_interval_ms: default_send_interval(),
            tick_rate_ms: default_tick_rate(),
            reconnect_base_ms: default_reconnect_base(),
            reconnect_max_ms: default_reconnect_max(),
        }
    }
}

/// Read a TOML file, falling back to defaults when it does not exist
async fn load_toml<T>(config_path: &Path) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    if !config_path.exists() {
        tracing::warn!(
            "Config file not found at {}, using defaults",
            config_path.display()
        );
        return Ok(T::default());
    }

    let content = tokio::fs::read_to_string(config_path)
        .await
        .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", config_path.display()))
}

fn env_flag(val: &str) -> bool {
    val.to_lowercase() == "true" || val == "1"
}

impl ServerConfig {
    /// Load configuration from file and environment variables
    pub async fn load() -> Result<Self> {
        let config_path = env::var("DOME_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/server.toml"));

        let mut config: Self = load_toml(&config_path).await?;
        config.config_path = config_path;

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("DOME_BIND_ADDRESS") {
            self.bind_address = val;
        }
        // PORT is what most hosting platforms hand out
        if let Ok(val) = env::var("PORT") {
            if let Ok(port) = val.parse() {
                self.websocket_port = port;
            }
        }
        if let Ok(val) = env::var("DOME_WEBSOCKET_PORT") {
            if let Ok(port) = val.parse() {
                self.websocket_port = port;
            }
        }
        if let Ok(val) = env::var("DOME_BROADCAST_MODE") {
            match val.parse() {
                Ok(mode) => self.broadcast_mode = mode,
                Err(e) => tracing::warn!("Ignoring DOME_BROADCAST_MODE: {}", e),
            }
        }
        if let Ok(val) = env::var("DOME_PRESENCE_TTL_SECS") {
            if let Ok(ttl) = val.parse() {
                self.presence_ttl_secs = ttl;
            }
        }
        if let Ok(val) = env::var("DOME_SWEEP_INTERVAL_SECS") {
            if let Ok(secs) = val.parse() {
                self.sweep_interval_secs = secs;
            }
        }
        if let Ok(val) = env::var("DOME_EVICT_ON_DISCONNECT") {
            self.evict_on_disconnect = env_flag(&val);
        }
        if let Ok(val) = env::var("DOME_MAX_PARTICIPANTS") {
            if let Ok(max) = val.parse() {
                self.max_participants = max;
            }
        }
        if let Ok(val) = env::var("DOME_IDLE_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse() {
                self.idle_timeout_secs = secs;
            }
        }
        if let Ok(val) = env::var("DOME_BIND_IDENTITY") {
            self.bind_identity = env_flag(&val);
        }
        if let Ok(val) = env::var("DOME_MIN_UPDATE_INTERVAL_MS") {
            if let Ok(ms) = val.parse() {
                self.min_update_interval_ms = ms;
            }
        }
        if let Ok(val) = env::var("DOME_MAX_CONNECTIONS_PER_IP") {
            if let Ok(max) = val.parse() {
                self.max_connections_per_ip = max;
            }
        }
        if let Ok(val) = env::var("DOME_OUTBOUND_BUFFER") {
            if let Ok(frames) = val.parse() {
                self.outbound_buffer = frames;
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.presence_ttl_secs > 0 && self.sweep_interval_secs == 0 {
            anyhow::bail!("Sweep interval must be at least 1 second when a presence TTL is set");
        }

        if self.max_connections_per_ip == 0 {
            anyhow::bail!("Max connections per IP must be at least 1");
        }

        if self.outbound_buffer == 0 {
            anyhow::bail!("Outbound buffer must hold at least one frame");
        }

        Ok(())
    }

    /// Socket address string the listener binds to
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.websocket_port)
    }

    pub fn presence_ttl(&self) -> Option<Duration> {
        (self.presence_ttl_secs > 0).then(|| Duration::from_secs(self.presence_ttl_secs))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn min_update_interval(&self) -> Option<Duration> {
        (self.min_update_interval_ms > 0).then(|| Duration::from_millis(self.min_update_interval_ms))
    }
}

impl ClientConfig {
    /// Load configuration from file and environment variables
    pub async fn load() -> Result<Self> {
        let config_path = env::var("DOME_CLIENT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/client.toml"));

        let mut config: Self = load_toml(&config_path).await?;
        config.config_path = config_path;

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("DOME_SERVER_URL") {
            self.server_url = val;
        }
        if let Ok(val) = env::var("DOME_IDENTITY") {
            self.identity = val;
        }
        if let Ok(val) = env::var("DOME_SEND_INTERVAL_MS") {
            if let Ok(ms) = val.parse() {
                self.send_interval_ms = ms;
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !(self.server_url.starts_with("ws://") || self.server_url.starts_with("wss://")) {
            anyhow::bail!("Server URL must use ws:// or wss://, got {}", self.server_url);
        }

        if self.identity.is_empty() {
            anyhow::bail!("Client identity must not be empty");
        }

        if self.send_interval_ms == 0 || self.tick_rate_ms == 0 {
            anyhow::bail!("Send interval and tick rate must be greater than zero");
        }

        if self.reconnect_base_ms == 0 || self.reconnect_base_ms > self.reconnect_max_ms {
            anyhow::bail!("Reconnect base delay must be between 1ms and the reconnect ceiling");
        }

        Ok(())
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms)
    }

    pub fn tick_rate(&self) -> Duration {
        Duration::from_millis(self.tick_rate_ms)
    }
}
