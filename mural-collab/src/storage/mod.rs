//! Durable, authoritative operation log.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐   append(op)    ┌──────────────────────────────┐
//! │ RelayServer │ ──────────────► │ OpLog (RocksDB)              │
//! │             │ ◄────────────── │                              │
//! └──────┬──────┘  log_sequence   │ CF "ops"   — LZ4 records,    │
//!        │                        │              room_id ‖ seq   │
//!        │ list_ordered(room)     │ CF "rooms" — room metadata   │
//!        ▼                        └──────────────────────────────┘
//!  join-time replay
//! ```
//!
//! The log is the single source of truth: the broadcast channel may
//! drop or reorder, but every operation is sequenced here exactly once
//! and a full ordered read reproduces the room deterministically.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (log-structured storage)

pub mod log;

pub use log::{LogError, OpLog, RoomMetadata, StoreConfig};
