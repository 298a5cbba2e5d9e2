//! Cursor and tool awareness for connected users.
//!
//! Presence rides the same WebSocket as operations but never touches
//! the operation log: updates are relayed to the room best-effort and a
//! lost update is simply superseded by the next one. Rendering remote
//! cursors is the UI layer's job; this module only tracks the latest
//! state per user and expires users that have gone quiet.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use mural_core::Tool;

/// A single presence beacon from one user.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    /// Cursor position in canvas coordinates.
    pub cursor_x: f32,
    pub cursor_y: f32,
    /// Tool the user currently holds.
    pub tool: Tool,
    /// Whether a stroke is in progress (mid-drag).
    pub drawing: bool,
}

impl Default for PresenceUpdate {
    fn default() -> Self {
        Self {
            cursor_x: 0.0,
            cursor_y: 0.0,
            tool: Tool::Pen,
            drawing: false,
        }
    }
}

/// Last-seen presence for one remote user.
#[derive(Debug, Clone)]
pub struct RemotePresence {
    pub update: PresenceUpdate,
    pub last_seen: Instant,
}

/// Tracks the latest presence state of every remote user in a room.
#[derive(Debug, Default)]
pub struct PresenceRoom {
    users: HashMap<Uuid, RemotePresence>,
}

impl PresenceRoom {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a presence update for a user.
    pub fn observe(&mut self, user_id: Uuid, update: PresenceUpdate) {
        self.users.insert(
            user_id,
            RemotePresence {
                update,
                last_seen: Instant::now(),
            },
        );
    }

    /// Drop a user that left the room.
    pub fn remove(&mut self, user_id: &Uuid) -> bool {
        self.users.remove(user_id).is_some()
    }

    /// Expire users not heard from within `max_age`. Returns the
    /// expired ids so the caller can clear their cursors.
    pub fn expire_stale(&mut self, max_age: Duration) -> Vec<Uuid> {
        let now = Instant::now();
        let stale: Vec<Uuid> = self
            .users
            .iter()
            .filter(|(_, p)| now.duration_since(p.last_seen) > max_age)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.users.remove(id);
        }
        stale
    }

    /// Latest state for one user.
    pub fn get(&self, user_id: &Uuid) -> Option<&RemotePresence> {
        self.users.get(user_id)
    }

    /// All tracked users and their latest updates.
    pub fn cursors(&self) -> impl Iterator<Item = (&Uuid, &PresenceUpdate)> {
        self.users.iter().map(|(id, p)| (id, &p.update))
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(x: f32, y: f32) -> PresenceUpdate {
        PresenceUpdate {
            cursor_x: x,
            cursor_y: y,
            tool: Tool::Pen,
            drawing: false,
        }
    }

    #[test]
    fn test_observe_and_get() {
        let mut room = PresenceRoom::new();
        let user = Uuid::new_v4();

        room.observe(user, update(10.0, 20.0));
        assert_eq!(room.len(), 1);

        let p = room.get(&user).unwrap();
        assert_eq!(p.update.cursor_x, 10.0);
        assert_eq!(p.update.cursor_y, 20.0);
    }

    #[test]
    fn test_observe_overwrites() {
        let mut room = PresenceRoom::new();
        let user = Uuid::new_v4();

        room.observe(user, update(1.0, 1.0));
        room.observe(user, update(2.0, 2.0));

        assert_eq!(room.len(), 1);
        assert_eq!(room.get(&user).unwrap().update.cursor_x, 2.0);
    }

    #[test]
    fn test_remove() {
        let mut room = PresenceRoom::new();
        let user = Uuid::new_v4();
        room.observe(user, update(0.0, 0.0));

        assert!(room.remove(&user));
        assert!(!room.remove(&user));
        assert!(room.is_empty());
    }

    #[test]
    fn test_expire_stale() {
        let mut room = PresenceRoom::new();
        let old = Uuid::new_v4();
        let fresh = Uuid::new_v4();

        room.observe(old, update(0.0, 0.0));
        // Backdate the first user past any reasonable threshold.
        if let Some(p) = room.users.get_mut(&old) {
            p.last_seen = Instant::now() - Duration::from_secs(60);
        }
        room.observe(fresh, update(1.0, 1.0));

        let expired = room.expire_stale(Duration::from_secs(30));
        assert_eq!(expired, vec![old]);
        assert_eq!(room.len(), 1);
        assert!(room.get(&fresh).is_some());
    }

    #[test]
    fn test_cursors_iteration() {
        let mut room = PresenceRoom::new();
        for i in 0..3 {
            room.observe(Uuid::new_v4(), update(i as f32, 0.0));
        }
        assert_eq!(room.cursors().count(), 3);
    }

    #[test]
    fn test_default_update() {
        let u = PresenceUpdate::default();
        assert_eq!(u.tool, Tool::Pen);
        assert!(!u.drawing);
    }
}
