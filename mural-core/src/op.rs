//! Operation model for the replicated drawing log.
//!
//! An [`OperationRecord`] is the single entity exchanged on the wire and
//! stored in the durable log. It is created once by its origin replica,
//! is immutable afterwards (the log sequence is filled in exactly once
//! on durable append), and is retained forever.
//!
//! The kind set is closed: `draw`, `erase`, `clear`, `undo`, `redo`.
//! Anything else fails to decode at the protocol boundary and never
//! reaches the fold.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

/// Unique operation identifier, assigned at creation by the origin replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpId(pub Uuid);

impl OpId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OpId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Drawing tool identity. Redundant with the operation kind; carried so
/// the input layer can round-trip its own notion of the active tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tool {
    Pen,
    Eraser,
}

/// 2D point in canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// A completed stroke: the payload of `draw` and `erase` operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stroke {
    /// Ordered sample points. Must be non-empty.
    pub points: Vec<Point>,
    /// Stroke width in canvas units.
    pub width: f32,
    /// RGBA color. Ignored for erase strokes.
    pub color: [f32; 4],
    /// Tool that produced the stroke.
    pub tool: Tool,
}

impl Stroke {
    pub fn pen(points: Vec<Point>, width: f32, color: [f32; 4]) -> Self {
        Self {
            points,
            width,
            color,
            tool: Tool::Pen,
        }
    }

    pub fn eraser(points: Vec<Point>, width: f32) -> Self {
        Self {
            points,
            width,
            color: [0.0, 0.0, 0.0, 0.0],
            tool: Tool::Eraser,
        }
    }
}

/// The closed set of operation kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    /// Add a pen stroke to the canvas.
    Draw(Stroke),
    /// Add an erase stroke (composite removal) to the canvas.
    Erase(Stroke),
    /// Discard the entire visible canvas. Never undoable.
    Clear,
    /// Global undo. The target id is the operation the origin popped;
    /// it is advisory only — the transition acts on the local tail.
    Undo { target: OpId },
    /// Global redo, symmetric to undo.
    Redo { target: OpId },
}

impl OpKind {
    /// Short name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Draw(_) => "draw",
            OpKind::Erase(_) => "erase",
            OpKind::Clear => "clear",
            OpKind::Undo { .. } => "undo",
            OpKind::Redo { .. } => "redo",
        }
    }
}

/// Validation failures for inbound operations.
///
/// Malformed records are dropped at the protocol boundary with a
/// diagnostic; they never reach the fold.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// Draw/erase stroke with no points.
    EmptyStroke,
    /// Stroke width is non-positive or non-finite.
    BadWidth(f32),
    /// Stroke tool contradicts the operation kind.
    ToolMismatch,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::EmptyStroke => write!(f, "stroke has no points"),
            ValidationError::BadWidth(w) => write!(f, "bad stroke width: {w}"),
            ValidationError::ToolMismatch => write!(f, "stroke tool contradicts operation kind"),
        }
    }
}

impl std::error::Error for ValidationError {}

/// A single replicated operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    /// Unique id, assigned at creation.
    pub id: OpId,
    /// What the operation does.
    pub kind: OpKind,
    /// Authoring replica. Attribution only — never used for ordering.
    pub origin_user_id: Uuid,
    /// Client wall-clock millis at creation. Advisory only, never an
    /// ordering key.
    pub created_at_local: u64,
    /// Authoritative order key, assigned by the durable log on append.
    /// `None` on the wire until the origin's write is acknowledged.
    pub log_sequence: Option<u64>,
}

impl OperationRecord {
    fn new(origin_user_id: Uuid, kind: OpKind) -> Self {
        Self {
            id: OpId::new(),
            kind,
            origin_user_id,
            created_at_local: now_millis(),
            log_sequence: None,
        }
    }

    /// Create a draw operation from a pen stroke.
    pub fn draw(origin_user_id: Uuid, stroke: Stroke) -> Self {
        Self::new(origin_user_id, OpKind::Draw(stroke))
    }

    /// Create an erase operation from an eraser stroke.
    pub fn erase(origin_user_id: Uuid, stroke: Stroke) -> Self {
        Self::new(origin_user_id, OpKind::Erase(stroke))
    }

    /// Create a canvas clear.
    pub fn clear(origin_user_id: Uuid) -> Self {
        Self::new(origin_user_id, OpKind::Clear)
    }

    /// Create a global undo referencing the operation the origin popped.
    pub fn undo(origin_user_id: Uuid, target: OpId) -> Self {
        Self::new(origin_user_id, OpKind::Undo { target })
    }

    /// Create a global redo referencing the operation the origin restored.
    pub fn redo(origin_user_id: Uuid, target: OpId) -> Self {
        Self::new(origin_user_id, OpKind::Redo { target })
    }

    /// Attach the log sequence assigned by the durable log.
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.log_sequence = Some(sequence);
        self
    }

    /// The stroke payload, if this is a draw or erase.
    pub fn stroke(&self) -> Option<&Stroke> {
        match &self.kind {
            OpKind::Draw(s) | OpKind::Erase(s) => Some(s),
            _ => None,
        }
    }

    /// Whether this operation contributes pixels (draw/erase) as opposed
    /// to manipulating the stack (clear/undo/redo).
    pub fn is_stroke_op(&self) -> bool {
        matches!(self.kind, OpKind::Draw(_) | OpKind::Erase(_))
    }

    /// Boundary validation. Clear/undo/redo are always well-formed;
    /// draw/erase require a non-empty stroke with a sane width and a
    /// tool consistent with the kind.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let (stroke, expect_tool) = match &self.kind {
            OpKind::Draw(s) => (s, Tool::Pen),
            OpKind::Erase(s) => (s, Tool::Eraser),
            _ => return Ok(()),
        };
        if stroke.points.is_empty() {
            return Err(ValidationError::EmptyStroke);
        }
        if !stroke.width.is_finite() || stroke.width <= 0.0 {
            return Err(ValidationError::BadWidth(stroke.width));
        }
        if stroke.tool != expect_tool {
            return Err(ValidationError::ToolMismatch);
        }
        Ok(())
    }
}

/// Milliseconds since the Unix epoch, client wall clock.
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pen_stroke() -> Stroke {
        Stroke::pen(vec![Point::new(0.0, 0.0), Point::new(5.0, 5.0)], 2.0, [0.0, 0.0, 0.0, 1.0])
    }

    #[test]
    fn test_draw_record_fields() {
        let user = Uuid::new_v4();
        let op = OperationRecord::draw(user, pen_stroke());

        assert_eq!(op.origin_user_id, user);
        assert!(op.log_sequence.is_none());
        assert!(op.is_stroke_op());
        assert_eq!(op.kind.name(), "draw");
        assert_eq!(op.stroke().unwrap().points.len(), 2);
    }

    #[test]
    fn test_unique_ids() {
        let user = Uuid::new_v4();
        let a = OperationRecord::clear(user);
        let b = OperationRecord::clear(user);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_with_sequence() {
        let op = OperationRecord::clear(Uuid::new_v4()).with_sequence(7);
        assert_eq!(op.log_sequence, Some(7));
    }

    #[test]
    fn test_validate_ok() {
        let user = Uuid::new_v4();
        assert!(OperationRecord::draw(user, pen_stroke()).validate().is_ok());
        assert!(OperationRecord::erase(user, Stroke::eraser(vec![Point::new(1.0, 1.0)], 8.0))
            .validate()
            .is_ok());
        assert!(OperationRecord::clear(user).validate().is_ok());
        assert!(OperationRecord::undo(user, OpId::new()).validate().is_ok());
        assert!(OperationRecord::redo(user, OpId::new()).validate().is_ok());
    }

    #[test]
    fn test_validate_empty_stroke() {
        let op = OperationRecord::draw(Uuid::new_v4(), Stroke::pen(vec![], 2.0, [0.0; 4]));
        assert_eq!(op.validate(), Err(ValidationError::EmptyStroke));
    }

    #[test]
    fn test_validate_bad_width() {
        let op = OperationRecord::draw(
            Uuid::new_v4(),
            Stroke::pen(vec![Point::new(0.0, 0.0)], 0.0, [0.0; 4]),
        );
        assert!(matches!(op.validate(), Err(ValidationError::BadWidth(_))));

        let op = OperationRecord::draw(
            Uuid::new_v4(),
            Stroke::pen(vec![Point::new(0.0, 0.0)], f32::NAN, [0.0; 4]),
        );
        assert!(matches!(op.validate(), Err(ValidationError::BadWidth(_))));
    }

    #[test]
    fn test_validate_tool_mismatch() {
        // An "erase" record carrying a pen stroke is corrupted input.
        let op = OperationRecord::erase(Uuid::new_v4(), pen_stroke());
        assert_eq!(op.validate(), Err(ValidationError::ToolMismatch));
    }

    #[test]
    fn test_control_ops_have_no_stroke() {
        let user = Uuid::new_v4();
        assert!(OperationRecord::clear(user).stroke().is_none());
        assert!(OperationRecord::undo(user, OpId::new()).stroke().is_none());
        assert!(!OperationRecord::redo(user, OpId::new()).is_stroke_op());
    }

    #[test]
    fn test_kind_names() {
        let user = Uuid::new_v4();
        assert_eq!(OperationRecord::clear(user).kind.name(), "clear");
        assert_eq!(OperationRecord::undo(user, OpId::new()).kind.name(), "undo");
        assert_eq!(OperationRecord::redo(user, OpId::new()).kind.name(), "redo");
        assert_eq!(
            OperationRecord::erase(user, Stroke::eraser(vec![Point::new(0.0, 0.0)], 4.0))
                .kind
                .name(),
            "erase"
        );
    }

    #[test]
    fn test_validation_error_display() {
        assert!(ValidationError::EmptyStroke.to_string().contains("no points"));
        assert!(ValidationError::BadWidth(-1.0).to_string().contains("-1"));
        assert!(ValidationError::ToolMismatch.to_string().contains("tool"));
    }
}
