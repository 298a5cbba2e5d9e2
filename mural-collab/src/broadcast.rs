//! Room-scoped fan-out of pre-encoded frames.
//!
//! Built on tokio broadcast channels: one channel per room, one
//! receiver per connected replica. The channel makes no ordering or
//! delivery promise the protocol would depend on — a lagging receiver
//! drops frames and the replica reconverges by replaying the durable
//! log on its next join. That tolerance is what lets the hot path stay
//! lock-free.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ProtocolError, ServerMessage, UserProfile};

/// Snapshot of a group's counters.
#[derive(Debug, Clone, Default)]
pub struct FanOutStats {
    pub frames_sent: u64,
    pub active_users: usize,
}

/// Fan-out group for one room.
///
/// Every replica in the room shares the sender; each holds its own
/// buffered receiver. Frames are encoded once and shared via `Arc`.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    /// Users currently subscribed to this room.
    users: Arc<RwLock<HashMap<Uuid, UserProfile>>>,
    capacity: usize,
    frames_sent: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` is the per-receiver buffer; a replica that falls more
    /// than `capacity` frames behind starts losing frames.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            users: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            frames_sent: AtomicU64::new(0),
        }
    }

    /// Register a user and hand back their receiver.
    pub async fn add_user(&self, profile: UserProfile) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut users = self.users.write().await;
        users.insert(profile.user_id, profile);
        self.sender.subscribe()
    }

    /// Remove a user; their receiver keeps draining what it already has.
    pub async fn remove_user(&self, user_id: &Uuid) -> Option<UserProfile> {
        self.users.write().await.remove(user_id)
    }

    /// Encode and fan out a message to every receiver (the sender's own
    /// receiver included — echo filtering is the session's job).
    /// Returns the receiver count at send time.
    pub fn send(&self, msg: &ServerMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.send_raw(Arc::new(encoded)))
    }

    /// Fan out an already-encoded frame. Lock-free.
    pub fn send_raw(&self, frame: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn user_count(&self) -> usize {
        self.users.read().await.len()
    }

    pub async fn users(&self) -> Vec<UserProfile> {
        self.users.read().await.values().cloned().collect()
    }

    pub async fn has_user(&self, user_id: &Uuid) -> bool {
        self.users.read().await.contains_key(user_id)
    }

    pub async fn stats(&self) -> FanOutStats {
        FanOutStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            active_users: self.users.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Raw subscription without user registration (tests, monitors).
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }
}

/// Maps room ids to their broadcast groups.
pub struct RoomManager {
    rooms: Arc<RwLock<HashMap<Uuid, Arc<BroadcastGroup>>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            default_capacity,
        }
    }

    /// Get the room's group, creating it on first join.
    pub async fn get_or_create(&self, room_id: Uuid) -> Arc<BroadcastGroup> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&room_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Re-check: another session may have created it between locks.
        if let Some(room) = rooms.get(&room_id) {
            return room.clone();
        }
        let room = Arc::new(BroadcastGroup::new(self.default_capacity));
        rooms.insert(room_id, room.clone());
        room
    }

    pub async fn get(&self, room_id: &Uuid) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Drop a room once its last user left. The durable log keeps the
    /// history; only the in-memory fan-out is discarded.
    pub async fn remove_if_empty(&self, room_id: &Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(room_id) {
            if room.user_count().await == 0 {
                rooms.remove(room_id);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().copied().collect()
    }
}
