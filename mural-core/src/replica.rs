//! Per-replica materialized view of a room and the fold rule that
//! builds it.
//!
//! Architecture:
//! ```text
//!                 draw/erase          clear
//!                     │                 │
//!                     ▼                 ▼
//!  active: [ op │ op │ op ]      active: []   undone: []
//!               ▲     │
//!          redo │     │ undo
//!               │     ▼
//!  undone: [ op │ op ]
//! ```
//!
//! The fold is a pure, order-dependent function: replaying the same
//! sequenced history always yields the same `(active, undone)` pair on
//! every replica. Live broadcast apply uses the *same* function in
//! arrival order, which may transiently diverge between replicas; a
//! full replay in log-sequence order is the reconvergence mechanism.
//!
//! Reference: Kleppmann — DDIA, Chapter 11 (log-derived state)

use std::collections::HashSet;

use crate::op::{OpId, OpKind, OperationRecord};

/// Result of folding one operation into the replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The operation was folded in (the transition itself may still have
    /// been a no-op, e.g. undo on an empty canvas).
    Applied,
    /// The id was already seen — idempotent re-delivery, nothing changed.
    AlreadySeen,
}

/// One connected client's in-memory view of a room.
///
/// Owned exclusively by its replica: every mutation (local submit,
/// remote apply, undo/redo) is serialized against this state and never
/// split across a suspension point.
#[derive(Debug, Default)]
pub struct ReplicaState {
    /// Apply-ordered operations currently contributing to the canvas.
    active: Vec<OperationRecord>,
    /// Operations removed by undo, in removal order (tail = most recent).
    undone: Vec<OperationRecord>,
    /// Ids already folded in, for idempotent re-delivery.
    seen: HashSet<OpId>,
    /// Locally applied ids not yet sequenced by the durable log.
    unconfirmed: HashSet<OpId>,
}

impl ReplicaState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a replica by replaying a durable-log history.
    ///
    /// Operations are folded in ascending `log_sequence` order; records
    /// without a sequence (there should be none in a log read) sort
    /// last, preserving their relative order.
    pub fn from_history(mut history: Vec<OperationRecord>) -> Self {
        history.sort_by_key(|op| op.log_sequence.unwrap_or(u64::MAX));
        let mut state = Self::new();
        for op in history {
            state.apply(op);
        }
        state
    }

    /// Fold one operation into the replica.
    ///
    /// This is the single transition function shared by join-time replay
    /// and live broadcast apply — the two paths are the same fold over
    /// different orderings.
    pub fn apply(&mut self, op: OperationRecord) -> ApplyOutcome {
        if self.seen.contains(&op.id) {
            log::trace!("duplicate delivery of {} ({}), ignoring", op.id, op.kind.name());
            return ApplyOutcome::AlreadySeen;
        }
        self.seen.insert(op.id);

        match &op.kind {
            OpKind::Draw(_) | OpKind::Erase(_) => {
                // Forward progress invalidates redo history, local or remote.
                self.undone.clear();
                self.active.push(op);
            }
            OpKind::Clear => {
                // Clear discards everything and is itself never undoable.
                self.active.clear();
                self.undone.clear();
            }
            OpKind::Undo { .. } => {
                // Global LIFO: acts on the local tail, not the target id.
                if let Some(popped) = self.active.pop() {
                    self.undone.push(popped);
                }
            }
            OpKind::Redo { .. } => {
                if let Some(restored) = self.undone.pop() {
                    self.active.push(restored);
                }
            }
        }

        ApplyOutcome::Applied
    }

    /// Whether an id has already been folded in.
    pub fn is_seen(&self, id: OpId) -> bool {
        self.seen.contains(&id)
    }

    /// Operations currently contributing to the canvas, in apply order.
    pub fn active(&self) -> &[OperationRecord] {
        &self.active
    }

    /// Undone operations, tail = most recently undone.
    pub fn undone(&self) -> &[OperationRecord] {
        &self.undone
    }

    /// Id of the operation a local undo would pop.
    pub fn undo_target(&self) -> Option<OpId> {
        self.active.last().map(|op| op.id)
    }

    /// Id of the operation a local redo would restore.
    pub fn redo_target(&self) -> Option<OpId> {
        self.undone.last().map(|op| op.id)
    }

    // ─── Confirmation tracking ────────────────────────────────────────

    /// Flag a locally applied operation as awaiting durable confirmation.
    pub fn mark_unconfirmed(&mut self, id: OpId) {
        self.unconfirmed.insert(id);
    }

    /// Record the log sequence assigned to a local operation.
    ///
    /// The record is updated in place wherever it currently lives
    /// (active or undone — it may have been undone before the ack came
    /// back). Returns false when the id is unknown.
    pub fn confirm(&mut self, id: OpId, sequence: u64) -> bool {
        self.unconfirmed.remove(&id);
        for op in self.active.iter_mut().chain(self.undone.iter_mut()) {
            if op.id == id {
                op.log_sequence = Some(sequence);
                return true;
            }
        }
        // Cleared or otherwise gone from both stacks; the ack still
        // counts — the log has it, which is what confirmation means.
        self.seen.contains(&id)
    }

    /// Ids applied locally but not yet acknowledged by the durable log.
    pub fn unconfirmed_ids(&self) -> Vec<OpId> {
        self.unconfirmed.iter().copied().collect()
    }

    /// Unconfirmed records still present in either stack, for
    /// re-submission after a reconnect.
    pub fn unconfirmed_records(&self) -> Vec<OperationRecord> {
        self.active
            .iter()
            .chain(self.undone.iter())
            .filter(|op| self.unconfirmed.contains(&op.id))
            .cloned()
            .collect()
    }

    pub fn has_unconfirmed(&self) -> bool {
        !self.unconfirmed.is_empty()
    }
}
