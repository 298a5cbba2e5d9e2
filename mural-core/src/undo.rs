//! Room-global undo/redo coordination.
//!
//! The undo stack is shared by every user in a room — there is no
//! per-user isolation. A local button press pops the local tail, folds
//! the transition into the replica, and hands back a control record for
//! the sync layer to submit; remote undo/redo records arrive through
//! the ordinary fold and perform the identical transition on *their*
//! replica's local tail.
//!
//! Operations are not independently invertible (erase is a composite
//! removal, not a pixel delta), so the rendering layer recomputes the
//! canvas from the full remaining `active` sequence after every
//! transition rather than applying an incremental inverse.

use uuid::Uuid;

use crate::op::OperationRecord;
use crate::replica::ReplicaState;

/// Drives local undo/redo against a [`ReplicaState`].
///
/// Stateless apart from the authoring user id; the two linked stacks
/// live in the replica itself.
#[derive(Debug, Clone, Copy)]
pub struct UndoRedoCoordinator {
    user_id: Uuid,
}

impl UndoRedoCoordinator {
    pub fn new(user_id: Uuid) -> Self {
        Self { user_id }
    }

    /// Pop the active tail into the undone stack.
    ///
    /// Returns the `undo` record to submit, or `None` when there is
    /// nothing to undo (no record is created — an empty undo is not
    /// worth a log entry).
    pub fn local_undo(&self, state: &mut ReplicaState) -> Option<OperationRecord> {
        let target = state.undo_target()?;
        let record = OperationRecord::undo(self.user_id, target);
        state.apply(record.clone());
        Some(record)
    }

    /// Restore the most recently undone operation.
    ///
    /// Symmetric to [`local_undo`](Self::local_undo): returns the `redo`
    /// record to submit, or `None` when the undone stack is empty.
    pub fn local_redo(&self, state: &mut ReplicaState) -> Option<OperationRecord> {
        let target = state.redo_target()?;
        let record = OperationRecord::redo(self.user_id, target);
        state.apply(record.clone());
        Some(record)
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }
}
