//! Binary wire protocol between replicas and the relay server.
//!
//! Messages are bincode-encoded (standard config) tagged enums. The
//! operation payload is the structured [`OperationRecord`] itself, so
//! an unknown kind or a truncated frame fails at decode and is dropped
//! with a diagnostic before it can reach any replica's fold.
//!
//! Flow:
//! ```text
//! client ── Join ──────────► server
//! client ◄───────── History ── server   (full log, ascending sequence)
//! client ── Submit(op) ────► server
//! client ◄──────────── Ack ── server   (op_id → log_sequence)
//! peers  ◄────── Operation ── server   (sequenced record, best-effort)
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use mural_core::{OpId, OperationRecord};

use crate::presence::PresenceUpdate;

/// Identity and display metadata for a connected user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: Uuid,
    pub name: String,
    /// RGBA attribution color, derived from the user id.
    pub color: [f32; 4],
}

impl UserProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Create with an explicit id (stable color for a stable id).
    pub fn with_id(user_id: Uuid, name: impl Into<String>) -> Self {
        let hash = user_id.as_u128();
        let r = (hash & 0xFF) as f32 / 255.0;
        let g = ((hash >> 8) & 0xFF) as f32 / 255.0;
        let b = ((hash >> 16) & 0xFF) as f32 / 255.0;
        Self {
            user_id,
            name: name.into(),
            color: [r, g, b, 1.0],
        }
    }
}

/// Messages a replica sends to the relay server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Enter a room. The server answers with `History` and starts
    /// forwarding the room's live traffic.
    Join { room_id: Uuid, profile: UserProfile },
    /// Submit a locally applied operation for sequencing and fan-out.
    Submit { op: OperationRecord },
    /// Cursor/tool beacon, relayed without persistence.
    Presence { update: PresenceUpdate },
    /// Heartbeat.
    Ping,
}

/// Messages the relay server sends to a replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Full ordered operation history, sent once after `Join`.
    /// Every record carries its `log_sequence`.
    History {
        room_id: Uuid,
        ops: Vec<OperationRecord>,
    },
    /// The durable log accepted the submitter's operation.
    Ack { op_id: OpId, sequence: u64 },
    /// A sequenced operation from some replica in the room.
    Operation { op: OperationRecord },
    /// A user entered the room.
    UserJoined { profile: UserProfile },
    /// A user left the room.
    UserLeft { user_id: Uuid },
    /// Relayed presence beacon.
    Presence {
        user_id: Uuid,
        update: PresenceUpdate,
    },
    /// Heartbeat reply.
    Pong,
    /// Server-side rejection diagnostic (e.g. malformed submit).
    Error { message: String },
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::Timeout => write!(f, "connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// The origin user of this message, when it has one. Used by the
    /// relay to avoid echoing a replica's own traffic back to it.
    pub fn origin(&self) -> Option<Uuid> {
        match self {
            ServerMessage::Operation { op } => Some(op.origin_user_id),
            ServerMessage::UserJoined { profile } => Some(profile.user_id),
            ServerMessage::UserLeft { user_id } => Some(*user_id),
            ServerMessage::Presence { user_id, .. } => Some(*user_id),
            _ => None,
        }
    }
}
