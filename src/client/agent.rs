//! Client sync agent
//!
//! Per-client logic that sits between the rendering layer and the socket:
//! - throttles outbound position samples to one per send interval
//! - reconciles inbound snapshots into remote avatar visuals
//!
//! The local avatar is authoritative locally: the agent never applies the
//! snapshot entry for its own identity.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::client::scene::AvatarScene;
use crate::error::Result;
use crate::protocol::{Position, PositionUpdate, Snapshot};

/// What one snapshot changed in the scene
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub spawned: usize,
    pub moved: usize,
    pub despawned: usize,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.spawned == 0 && self.moved == 0 && self.despawned == 0
    }
}

/// Client-side sync state for one participant
#[derive(Debug)]
pub struct SyncAgent {
    identity: String,
    send_interval: Duration,
    last_sent: Option<Instant>,
    /// Remote avatars the scene currently shows
    remotes: HashMap<String, Position>,
}

impl SyncAgent {
    pub fn new(identity: impl Into<String>, send_interval: Duration) -> Self {
        Self {
            identity: identity.into(),
            send_interval,
            last_sent: None,
            remotes: HashMap::new(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Produce an update for this tick unless one went out less than a send
    /// interval ago.
    pub fn poll_outbound(&mut self, now: Instant, local: Position) -> Option<PositionUpdate> {
        if let Some(last) = self.last_sent {
            if now.saturating_duration_since(last) < self.send_interval {
                return None;
            }
        }
        self.last_sent = Some(now);
        Some(PositionUpdate::new(self.identity.clone(), local))
    }

    /// Allow the next poll to send immediately (after a reconnect)
    pub fn reset_throttle(&mut self) {
        self.last_sent = None;
    }

    /// Apply a snapshot to the scene.
    ///
    /// Unknown identities are spawned, known ones moved in place, and remote
    /// avatars missing from the snapshot despawned.
    pub fn apply_snapshot<S>(&mut self, snapshot: &Snapshot, scene: &mut S) -> ReconcileReport
    where
        S: AvatarScene + ?Sized,
    {
        let mut report = ReconcileReport::default();

        for (id, position) in snapshot.iter() {
            if *id == self.identity {
                continue;
            }

            match self.remotes.get_mut(id) {
                Some(current) => {
                    if *current != *position {
                        *current = *position;
                        scene.move_remote(id, *position);
                        report.moved += 1;
                    }
                }
                None => {
                    self.remotes.insert(id.clone(), *position);
                    scene.spawn_remote(id, *position);
                    report.spawned += 1;
                }
            }
        }

        let departed: Vec<String> = self
            .remotes
            .keys()
            .filter(|id| !snapshot.contains(id))
            .cloned()
            .collect();
        for id in departed {
            self.remotes.remove(&id);
            scene.despawn_remote(&id);
            report.despawned += 1;
        }

        if !report.is_empty() {
            trace!(
                spawned = report.spawned,
                moved = report.moved,
                despawned = report.despawned,
                "Snapshot reconciled"
            );
        }

        report
    }

    /// Decode a server text frame and apply it
    pub fn handle_frame<S>(&mut self, text: &str, scene: &mut S) -> Result<ReconcileReport>
    where
        S: AvatarScene + ?Sized,
    {
        let snapshot = Snapshot::from_json(text)?;
        Ok(self.apply_snapshot(&snapshot, scene))
    }

    pub fn remote_position(&self, id: &str) -> Option<Position> {
        self.remotes.get(id).copied()
    }

    pub fn remote_count(&self) -> usize {
        self.remotes.len()
    }
}
