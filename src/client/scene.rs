//! Rendering/input boundary
//!
//! The sync agent never touches rendering primitives. It reads the local
//! avatar position and issues spawn/move/despawn instructions for remote
//! avatars through `AvatarScene`.

use std::collections::HashMap;

use rand::Rng;

use crate::protocol::Position;

/// What the sync agent needs from the rendering layer
pub trait AvatarScene: Send {
    /// Current position of the locally controlled avatar
    fn local_position(&self) -> Position;

    /// Create a visual for a remote participant seen for the first time
    fn spawn_remote(&mut self, id: &str, position: Position);

    /// Move an existing remote visual (no easing)
    fn move_remote(&mut self, id: &str, position: Position);

    /// Remove a remote visual
    fn despawn_remote(&mut self, id: &str);
}

/// Scene without a renderer: tracks positions in memory.
///
/// Used by the headless client and in tests.
#[derive(Debug, Clone, Default)]
pub struct HeadlessScene {
    local: Position,
    remotes: HashMap<String, Position>,
}

impl HeadlessScene {
    pub fn new(local: Position) -> Self {
        Self {
            local,
            remotes: HashMap::new(),
        }
    }

    pub fn set_local(&mut self, position: Position) {
        self.local = position;
    }

    /// Move the local avatar one tile in a random cardinal direction
    pub fn wander<R: Rng>(&mut self, rng: &mut R) {
        let (dx, dy) = match rng.gen_range(0..4) {
            0 => (1.0, 0.0),
            1 => (-1.0, 0.0),
            2 => (0.0, 1.0),
            _ => (0.0, -1.0),
        };
        self.local = Position::new(self.local.x + dx, self.local.y + dy);
    }

    pub fn remote(&self, id: &str) -> Option<Position> {
        self.remotes.get(id).copied()
    }

    pub fn remote_count(&self) -> usize {
        self.remotes.len()
    }

    pub fn remote_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.remotes.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl AvatarScene for HeadlessScene {
    fn local_position(&self) -> Position {
        self.local
    }

    fn spawn_remote(&mut self, id: &str, position: Position) {
        self.remotes.insert(id.to_string(), position);
    }

    fn move_remote(&mut self, id: &str, position: Position) {
        if let Some(current) = self.remotes.get_mut(id) {
            *current = position;
        }
    }

    fn despawn_remote(&mut self, id: &str) {
        self.remotes.remove(id);
    }
}
