//! # mural-collab — Replicated operation log and sync layer for Mural
//!
//! Provides WebSocket-based multiplayer drawing with a durable,
//! authoritative operation log and global undo/redo.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ SyncEngine   │ ◄────────────────► │ RelayServer  │
//! │ (per user)   │    Binary Proto    │ (sequencer)  │
//! └──────┬───────┘                    └──────┬───────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌──────────────┐                    ┌──────────────┐
//! │ ReplicaState │                    │ OpLog        │
//! │ (fold rule)  │                    │ (RocksDB)    │
//! └──────────────┘                    └──────┬───────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ BroadcastGroup│
//!                                    │ (fan-out)     │
//!                                    └───────────────┘
//! ```
//!
//! Every operation takes the same round trip: applied optimistically on
//! its origin replica, sequenced exactly once by the durable log,
//! acked back to the submitter, and fanned out best-effort to the
//! room. Replicas that miss a broadcast reconverge by replaying the
//! log on their next join.
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded messages)
//! - [`broadcast`] — Room-based fan-out over tokio broadcast channels
//! - [`storage`] — RocksDB-backed sequenced operation log
//! - [`server`] — WebSocket relay server and per-room sequencer
//! - [`client`] — Sync engine with optimistic apply and join replay
//! - [`presence`] — Ephemeral cursor/tool beacons

pub mod protocol;
pub mod broadcast;
pub mod server;
pub mod client;
pub mod presence;
pub mod storage;

// Re-exports for convenience
pub use protocol::{ClientMessage, ProtocolError, ServerMessage, UserProfile};
pub use broadcast::{BroadcastGroup, FanOutStats, RoomManager};
pub use presence::{PresenceRoom, PresenceUpdate, RemotePresence};
pub use server::{RelayServer, ServerConfig, ServerStats};
pub use client::{ClientConfig, ConnectionState, SyncEngine, SyncError, SyncEvent};
pub use storage::{LogError, OpLog, RoomMetadata, StoreConfig};
