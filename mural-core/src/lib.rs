//! # mural-core — Replicated drawing state for Mural
//!
//! Pure, I/O-free model of a shared drawing room: the operation record
//! exchanged between replicas, the per-replica fold that materializes a
//! canvas from an operation stream, and the room-global undo/redo
//! coordinator.
//!
//! ## Architecture
//!
//! ```text
//!  local input ──► OperationRecord ──► ReplicaState::apply (optimistic)
//!                        │                     ▲
//!                        ▼                     │ same fold
//!                  durable log ──► ordered history ──► replay on join
//!                        │
//!                        ▼
//!                broadcast fan-out ──► remote ReplicaState::apply
//! ```
//!
//! The fold rule is the contract: join-time replay in log-sequence
//! order and live apply in arrival order are the same function over
//! different orderings, so a full replay is always a valid
//! reconvergence point no matter what the broadcast channel dropped or
//! reordered.
//!
//! ## Modules
//!
//! - [`op`] — `OperationRecord` and its closed kind set, with boundary
//!   validation
//! - [`replica`] — `ReplicaState`: active/undone stacks, seen-set
//!   idempotency, confirmation tracking, the fold rule
//! - [`undo`] — `UndoRedoCoordinator`: local transitions that emit the
//!   control records to replicate

pub mod op;
pub mod replica;
pub mod undo;

pub use op::{OpId, OpKind, OperationRecord, Point, Stroke, Tool, ValidationError};
pub use replica::{ApplyOutcome, ReplicaState};
pub use undo::UndoRedoCoordinator;
