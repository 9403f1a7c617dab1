//! Presence store
//!
//! The authoritative mapping from participant identity to last known
//! position. All access goes through `upsert`/`remove`/`snapshot`; the map is
//! never handed out. Each entry is written whole under the write lock, so a
//! reader sees either the previous or the new position, never a mix.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::error::PresenceError;
use crate::protocol::{Position, Snapshot};

/// A stored presence entry
#[derive(Debug, Clone, Copy)]
struct PresenceEntry {
    position: Position,
    last_seen: Instant,
}

/// Result of an accepted upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// First update seen for this identity
    Inserted,
    /// Existing entry overwritten
    Updated,
}

/// Thread-safe presence store
pub struct PresenceStore {
    entries: RwLock<HashMap<String, PresenceEntry>>,
    /// Maximum number of identities (0 = unbounded)
    capacity: usize,
}

impl PresenceStore {
    /// Create an unbounded store
    pub fn new() -> Self {
        Self::with_capacity_limit(0)
    }

    /// Create a store that refuses new identities once `capacity` are held
    pub fn with_capacity_limit(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Insert or overwrite the entry for `id`
    pub fn upsert(&self, id: &str, position: Position) -> Result<UpsertOutcome, PresenceError> {
        self.upsert_at(id, position, Instant::now())
    }

    /// Insert or overwrite the entry for `id`, stamping it as seen at `now`
    pub fn upsert_at(
        &self,
        id: &str,
        position: Position,
        now: Instant,
    ) -> Result<UpsertOutcome, PresenceError> {
        let mut entries = self.entries.write();

        if let Some(entry) = entries.get_mut(id) {
            entry.position = position;
            entry.last_seen = now;
            trace!(identity = %id, x = position.x, y = position.y, "Presence updated");
            return Ok(UpsertOutcome::Updated);
        }

        if self.capacity > 0 && entries.len() >= self.capacity {
            return Err(PresenceError::CapacityExceeded {
                capacity: self.capacity,
            });
        }

        entries.insert(
            id.to_string(),
            PresenceEntry {
                position,
                last_seen: now,
            },
        );
        debug!(identity = %id, x = position.x, y = position.y, "Presence created");
        Ok(UpsertOutcome::Inserted)
    }

    /// Remove the entry for `id`, returning whether one existed
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.entries.write().remove(id).is_some();
        if removed {
            debug!(identity = %id, "Presence removed");
        }
        removed
    }

    /// Remove the entry for `id` unless `claimed` says someone still holds it.
    ///
    /// `claimed` runs under the write lock, so an upsert cannot land between
    /// the check and the removal.
    pub fn remove_unless<F>(&self, id: &str, claimed: F) -> bool
    where
        F: FnOnce(&str) -> bool,
    {
        let mut entries = self.entries.write();
        if !entries.contains_key(id) || claimed(id) {
            return false;
        }
        entries.remove(id);
        debug!(identity = %id, "Presence removed");
        true
    }

    /// Copy of the whole mapping at a single instant
    pub fn snapshot(&self) -> Snapshot {
        self.entries
            .read()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.position))
            .collect()
    }

    /// Last known position for `id`
    pub fn get(&self, id: &str) -> Option<Position> {
        self.entries.read().get(id).map(|entry| entry.position)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Evict every entry not seen within `ttl` of `now`.
    ///
    /// Returns the evicted identities.
    pub fn evict_stale(&self, ttl: Duration, now: Instant) -> Vec<String> {
        let mut entries = self.entries.write();
        let mut evicted = Vec::new();

        entries.retain(|id, entry| {
            let fresh = now.saturating_duration_since(entry.last_seen) <= ttl;
            if !fresh {
                evicted.push(id.clone());
            }
            fresh
        });

        evicted
    }
}

impl Default for PresenceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PresenceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceStore")
            .field("participants", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
