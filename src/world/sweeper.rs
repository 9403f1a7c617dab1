//! Stale presence sweeper
//!
//! Periodically evicts participants that have not sent an update within the
//! configured TTL. In fan-out mode every eviction pass that removed someone
//! pushes a fresh snapshot to all connections.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{BroadcastMode, ServerConfig};
use crate::state::AppState;

/// Periodic TTL eviction task
#[derive(Debug)]
pub struct PresenceSweeper {
    ttl: Duration,
    interval: Duration,
    /// Completed sweep passes
    passes: AtomicU64,
    /// Total evicted identities
    evicted: AtomicU64,
}

impl PresenceSweeper {
    pub fn new(ttl: Duration, interval: Duration) -> Self {
        Self {
            ttl,
            interval,
            passes: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// Build a sweeper from config, or `None` when the TTL is disabled
    pub fn from_config(config: &ServerConfig) -> Option<Self> {
        config
            .presence_ttl()
            .map(|ttl| Self::new(ttl, config.sweep_interval()))
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::SeqCst)
    }

    pub fn total_evicted(&self) -> u64 {
        self.evicted.load(Ordering::SeqCst)
    }

    /// Run one eviction pass as of `now`, returning the evicted identities
    pub fn sweep(&self, state: &AppState, now: Instant) -> Vec<String> {
        self.passes.fetch_add(1, Ordering::SeqCst);

        let evicted = state.presence.evict_stale(self.ttl, now);
        if evicted.is_empty() {
            return evicted;
        }

        self.evicted.fetch_add(evicted.len() as u64, Ordering::SeqCst);
        info!(
            evicted = ?evicted,
            ttl_secs = self.ttl.as_secs(),
            "Evicted stale participants"
        );

        if state.config.broadcast_mode == BroadcastMode::FanOut {
            if let Err(e) = state.broadcast_snapshot() {
                warn!(error = %e, "Failed to broadcast snapshot after eviction");
            }
        }

        evicted
    }

    /// Run the sweep loop until shutdown
    pub async fn run(&self, state: &AppState, shutdown_rx: &mut broadcast::Receiver<()>) {
        info!(
            ttl_secs = self.ttl.as_secs(),
            interval_secs = self.interval.as_secs(),
            "Starting presence sweeper"
        );

        let mut sweep_interval = interval(self.interval);
        sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = sweep_interval.tick() => {
                    self.sweep(state, Instant::now());

                    let passes = self.passes();
                    if passes % 100 == 0 {
                        debug!(
                            passes = passes,
                            participants = state.presence.len(),
                            sessions = state.sessions.count(),
                            "Presence sweep milestone"
                        );
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Presence sweeper received shutdown signal");
                    break;
                }
            }
        }

        info!(
            passes = self.passes(),
            evicted = self.total_evicted(),
            "Presence sweeper stopped"
        );
    }
}
