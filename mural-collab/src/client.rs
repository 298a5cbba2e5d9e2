//! WebSocket sync engine driving one replica of a room.
//!
//! Provides:
//! - Connection lifecycle (join, disconnect, rejoin)
//! - Optimistic local apply with ack-based confirmation
//! - Join-time replay of the durable log into a fresh replica
//! - Resend of unconfirmed operations after a reconnect
//! - Presence (cursor/tool) beacons
//!
//! Reference: Kleppmann, Chapter 5 — Replication
//!
//! Local operations are folded into the replica immediately and marked
//! unconfirmed; the server's `Ack` upgrades them with their assigned
//! `log_sequence`. Remote operations arrive in broadcast order and go
//! through the same fold. When the engine rejoins, the replica is
//! rebuilt from the server's full history and any still-unconfirmed
//! local operations are re-applied and re-submitted. A resend whose
//! original append succeeded but whose ack was lost gets sequenced a
//! second time; every replica folds a given id at most once, so the
//! duplicate record is harmless.

use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use mural_core::{
    ApplyOutcome, OpId, OperationRecord, ReplicaState, Stroke, UndoRedoCoordinator,
    ValidationError,
};

use crate::presence::PresenceUpdate;
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage, UserProfile};

/// Engine connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long to wait for the join-time `History` before giving up
    pub join_timeout: Duration,
    /// Attempts to hand a frame to the writer task before declaring
    /// the connection gone
    pub send_retry_limit: u32,
    /// Initial backoff between send attempts; doubles per retry
    pub retry_backoff_ms: u64,
    /// Buffered application events
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_secs(10),
            send_retry_limit: 5,
            retry_backoff_ms: 250,
            event_capacity: 256,
        }
    }
}

impl ClientConfig {
    /// Short timeouts for tests.
    pub fn for_testing() -> Self {
        Self {
            join_timeout: Duration::from_secs(2),
            send_retry_limit: 2,
            retry_backoff_ms: 10,
            event_capacity: 64,
        }
    }
}

/// Events emitted to the application.
///
/// Local folds are not mirrored here: `submit_local`, `undo`, and
/// `redo` apply synchronously and report through their return values,
/// so `OperationApplied` carries remote traffic only and `Confirmed`
/// closes the loop on local submissions.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Join handshake finished; the replica now reflects the full log.
    Joined { room_id: Uuid, op_count: usize },
    /// A remote operation was folded into the replica.
    OperationApplied { op: OperationRecord },
    /// The durable log sequenced one of our operations.
    Confirmed { op_id: OpId, sequence: u64 },
    /// A user entered the room.
    UserJoined(UserProfile),
    /// A user left the room.
    UserLeft(Uuid),
    /// Remote cursor/tool beacon.
    Presence {
        user_id: Uuid,
        update: PresenceUpdate,
    },
    /// The server rejected something we sent.
    Rejected { message: String },
    /// Connection lost.
    Disconnected,
}

/// Engine errors.
#[derive(Debug)]
pub enum SyncError {
    Protocol(ProtocolError),
    Validation(ValidationError),
    JoinTimeout,
    NotConnected,
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
            Self::Validation(e) => write!(f, "invalid operation: {e}"),
            Self::JoinTimeout => write!(f, "timed out waiting for room history"),
            Self::NotConnected => write!(f, "not connected"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<ProtocolError> for SyncError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<ValidationError> for SyncError {
    fn from(e: ValidationError) -> Self {
        Self::Validation(e)
    }
}

/// The sync engine.
///
/// Owns one [`ReplicaState`] and keeps it converged with the room:
/// local mutations are applied optimistically and submitted, remote
/// traffic is folded in as it arrives, and every (re)join replaces the
/// replica with a replay of the authoritative log.
pub struct SyncEngine {
    /// Our identity
    profile: UserProfile,

    /// Room we're drawing in
    room_id: Uuid,

    /// Server URL
    server_url: String,

    config: ClientConfig,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// The materialized room view. Never held across an await while a
    /// fold is in progress.
    replica: Arc<Mutex<ReplicaState>>,

    /// Builds undo/redo records against the replica's local tail.
    coordinator: UndoRedoCoordinator,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncEngine {
    pub fn new(profile: UserProfile, room_id: Uuid, server_url: impl Into<String>) -> Self {
        Self::with_config(profile, room_id, server_url, ClientConfig::default())
    }

    pub fn with_config(
        profile: UserProfile,
        room_id: Uuid,
        server_url: impl Into<String>,
        config: ClientConfig,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);
        let coordinator = UndoRedoCoordinator::new(profile.user_id);
        Self {
            profile,
            room_id,
            server_url: server_url.into(),
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            replica: Arc::new(Mutex::new(ReplicaState::new())),
            coordinator,
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect, join the room, and replay its history.
    ///
    /// Blocks until the server's `History` arrives (bounded by
    /// `join_timeout`), then spawns the reader task and returns. Any
    /// operations still unconfirmed from a previous connection are
    /// re-applied on top of the replay and re-submitted.
    pub async fn join(&mut self) -> Result<(), SyncError> {
        {
            let mut state = self.state.write().await;
            *state = if *state == ConnectionState::Disconnected {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting
            };
        }

        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.server_url)
            .await
            .map_err(|_| {
                SyncError::Protocol(ProtocolError::ConnectionClosed)
            })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let join = ClientMessage::Join {
            room_id: self.room_id,
            profile: self.profile.clone(),
        };
        ws_writer
            .send(Message::Binary(join.encode()?.into()))
            .await
            .map_err(|_| SyncError::Protocol(ProtocolError::ConnectionClosed))?;

        // Wait for the history. Live frames that slip in ahead of it
        // are buffered and folded after the replay; the seen-set makes
        // any overlap with the history harmless.
        let mut early_ops: Vec<OperationRecord> = Vec::new();
        let history = tokio::time::timeout(self.config.join_timeout, async {
            loop {
                match ws_reader.next().await {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        match ServerMessage::decode(&bytes) {
                            Ok(ServerMessage::History { ops, .. }) => return Ok(ops),
                            Ok(ServerMessage::Operation { op }) => early_ops.push(op),
                            Ok(_) => {}
                            Err(e) => log::warn!("undecodable frame during join: {e}"),
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) | None => {
                        return Err(SyncError::Protocol(ProtocolError::ConnectionClosed))
                    }
                }
            }
        })
        .await
        .map_err(|_| SyncError::JoinTimeout)??;

        // Replay, then re-apply what the old replica had in flight.
        let (op_count, resend) = {
            let mut replica = self.replica.lock().await;
            let pending = replica.unconfirmed_records();

            let mut fresh = ReplicaState::from_history(history);
            for op in early_ops {
                fresh.apply(op);
            }

            let mut resend = Vec::new();
            for op in pending {
                if !fresh.is_seen(op.id) {
                    fresh.apply(op.clone());
                    fresh.mark_unconfirmed(op.id);
                    resend.push(op);
                }
            }

            let count = fresh.active().len();
            *replica = fresh;
            (count, resend)
        };

        // Writer task: forward the outgoing channel to the socket.
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(self.config.event_capacity);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
        });

        if !resend.is_empty() {
            log::info!("resubmitting {} unconfirmed operations", resend.len());
            for op in resend {
                let frame = ClientMessage::Submit { op }.encode()?;
                self.send_frame(frame).await;
            }
        }

        *self.state.write().await = ConnectionState::Connected;
        let _ = self
            .event_tx
            .send(SyncEvent::Joined {
                room_id: self.room_id,
                op_count,
            })
            .await;

        // Reader task: fold remote traffic into the replica and surface
        // events to the application.
        let replica = self.replica.clone();
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let own_id = self.profile.user_id;
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let server_msg = match ServerMessage::decode(&bytes) {
                            Ok(m) => m,
                            Err(e) => {
                                log::warn!("undecodable frame, dropping: {e}");
                                continue;
                            }
                        };

                        match server_msg {
                            ServerMessage::Operation { op } => {
                                if let Err(e) = op.validate() {
                                    log::warn!("malformed remote op {}, dropping: {e}", op.id);
                                    continue;
                                }
                                let outcome = replica.lock().await.apply(op.clone());
                                if outcome == ApplyOutcome::Applied {
                                    let _ = event_tx
                                        .send(SyncEvent::OperationApplied { op })
                                        .await;
                                }
                            }
                            ServerMessage::Ack { op_id, sequence } => {
                                let known = replica.lock().await.confirm(op_id, sequence);
                                if !known {
                                    log::warn!("ack for unknown op {op_id}");
                                }
                                let _ = event_tx
                                    .send(SyncEvent::Confirmed { op_id, sequence })
                                    .await;
                            }
                            ServerMessage::UserJoined { profile } => {
                                if profile.user_id != own_id {
                                    let _ = event_tx.send(SyncEvent::UserJoined(profile)).await;
                                }
                            }
                            ServerMessage::UserLeft { user_id } => {
                                let _ = event_tx.send(SyncEvent::UserLeft(user_id)).await;
                            }
                            ServerMessage::Presence { user_id, update } => {
                                if user_id != own_id {
                                    let _ = event_tx
                                        .send(SyncEvent::Presence { user_id, update })
                                        .await;
                                }
                            }
                            ServerMessage::Error { message } => {
                                log::warn!("server rejection: {message}");
                                let _ = event_tx.send(SyncEvent::Rejected { message }).await;
                            }
                            ServerMessage::Pong | ServerMessage::History { .. } => {}
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Validate, optimistically apply, and submit a local operation.
    ///
    /// The fold happens before the network send, so the local canvas
    /// updates immediately. While disconnected the operation stays in
    /// the unconfirmed set and is resubmitted by the next [`join`].
    ///
    /// [`join`]: SyncEngine::join
    pub async fn submit_local(&self, op: OperationRecord) -> Result<OpId, SyncError> {
        op.validate()?;

        let id = op.id;
        {
            let mut replica = self.replica.lock().await;
            if replica.apply(op.clone()) == ApplyOutcome::AlreadySeen {
                return Ok(id);
            }
            replica.mark_unconfirmed(id);
        }

        let frame = ClientMessage::Submit { op }.encode()?;
        if !self.send_frame(frame).await {
            log::debug!("offline, {id} will be resubmitted on the next join");
        }
        Ok(id)
    }

    /// Draw a stroke.
    pub async fn submit_draw(&self, stroke: Stroke) -> Result<OpId, SyncError> {
        self.submit_local(OperationRecord::draw(self.profile.user_id, stroke))
            .await
    }

    /// Erase along a stroke path.
    pub async fn submit_erase(&self, stroke: Stroke) -> Result<OpId, SyncError> {
        self.submit_local(OperationRecord::erase(self.profile.user_id, stroke))
            .await
    }

    /// Wipe the canvas for everyone.
    pub async fn submit_clear(&self) -> Result<OpId, SyncError> {
        self.submit_local(OperationRecord::clear(self.profile.user_id))
            .await
    }

    /// Undo the most recent active operation, whoever drew it.
    ///
    /// Returns the submitted undo record's id, or `None` when there is
    /// nothing to undo.
    pub async fn undo(&self) -> Result<Option<OpId>, SyncError> {
        let record = {
            let mut replica = self.replica.lock().await;
            let Some(record) = self.coordinator.local_undo(&mut replica) else {
                return Ok(None);
            };
            replica.mark_unconfirmed(record.id);
            record
        };

        let id = record.id;
        let frame = ClientMessage::Submit { op: record }.encode()?;
        if !self.send_frame(frame).await {
            log::debug!("offline, undo {id} will be resubmitted on the next join");
        }
        Ok(Some(id))
    }

    /// Restore the most recently undone operation.
    pub async fn redo(&self) -> Result<Option<OpId>, SyncError> {
        let record = {
            let mut replica = self.replica.lock().await;
            let Some(record) = self.coordinator.local_redo(&mut replica) else {
                return Ok(None);
            };
            replica.mark_unconfirmed(record.id);
            record
        };

        let id = record.id;
        let frame = ClientMessage::Submit { op: record }.encode()?;
        if !self.send_frame(frame).await {
            log::debug!("offline, redo {id} will be resubmitted on the next join");
        }
        Ok(Some(id))
    }

    /// Send a cursor/tool beacon. Silently dropped while offline —
    /// presence is ephemeral.
    pub async fn send_presence(&self, update: PresenceUpdate) -> Result<(), SyncError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Ok(());
        }
        let frame = ClientMessage::Presence { update }.encode()?;
        self.send_frame(frame).await;
        Ok(())
    }

    /// Heartbeat.
    pub async fn send_ping(&self) -> Result<(), SyncError> {
        let frame = ClientMessage::Ping.encode()?;
        if self.send_frame(frame).await {
            Ok(())
        } else {
            Err(SyncError::NotConnected)
        }
    }

    /// Close the connection. The replica keeps its state; unconfirmed
    /// operations survive and are resubmitted by the next [`join`].
    ///
    /// [`join`]: SyncEngine::join
    pub async fn disconnect(&mut self) {
        // Dropping the writer channel closes the socket from our side;
        // the reader task notices and emits Disconnected.
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Hand a frame to the writer task, retrying with doubling backoff.
    /// Returns false when the connection is gone.
    async fn send_frame(&self, frame: Vec<u8>) -> bool {
        let Some(tx) = self.outgoing_tx.as_ref() else {
            return false;
        };

        let mut backoff = self.config.retry_backoff_ms;
        for attempt in 0..=self.config.send_retry_limit {
            match tx.try_send(frame.clone()) {
                Ok(()) => return true,
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    *self.state.write().await = ConnectionState::Disconnected;
                    return false;
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    if attempt == self.config.send_retry_limit {
                        break;
                    }
                    log::debug!("writer backlog, retrying in {backoff}ms");
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    backoff *= 2;
                }
            }
        }
        false
    }

    /// Current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Snapshot of the operations currently on the canvas, in apply
    /// order.
    pub async fn active_ops(&self) -> Vec<OperationRecord> {
        self.replica.lock().await.active().to_vec()
    }

    /// How deep the redo stack is.
    pub async fn undone_count(&self) -> usize {
        self.replica.lock().await.undone().len()
    }

    /// Whether any local operations still await a durable ack.
    pub async fn has_unconfirmed(&self) -> bool {
        self.replica.lock().await.has_unconfirmed()
    }

    pub async fn unconfirmed_count(&self) -> usize {
        self.replica.lock().await.unconfirmed_ids().len()
    }

    pub fn profile(&self) -> &UserProfile {
        &self.profile
    }

    pub fn room_id(&self) -> Uuid {
        self.room_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mural_core::Point;

    fn stroke(x: f32) -> Stroke {
        Stroke::pen(vec![Point::new(x, x), Point::new(x + 1.0, x)], 2.0, [
            0.0, 0.0, 0.0, 1.0,
        ])
    }

    fn engine() -> SyncEngine {
        SyncEngine::with_config(
            UserProfile::new("TestUser"),
            Uuid::new_v4(),
            "ws://localhost:9400",
            ClientConfig::for_testing(),
        )
    }

    #[test]
    fn test_engine_creation() {
        let room = Uuid::new_v4();
        let engine = SyncEngine::new(UserProfile::new("TestUser"), room, "ws://localhost:9400");

        assert_eq!(engine.profile().name, "TestUser");
        assert_eq!(engine.room_id(), room);
        assert_eq!(engine.server_url(), "ws://localhost:9400");
    }

    #[tokio::test]
    async fn test_initial_state() {
        let engine = engine();
        assert_eq!(engine.connection_state().await, ConnectionState::Disconnected);
        assert!(engine.active_ops().await.is_empty());
        assert!(!engine.has_unconfirmed().await);
    }

    #[tokio::test]
    async fn test_offline_submit_applies_optimistically() {
        let engine = engine();

        let id = engine.submit_draw(stroke(1.0)).await.unwrap();

        // Canvas reflects the op immediately, ack or not.
        let active = engine.active_ops().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, id);
        assert_eq!(active[0].log_sequence, None);
        assert!(engine.has_unconfirmed().await);
        assert_eq!(engine.unconfirmed_count().await, 1);
    }

    #[tokio::test]
    async fn test_offline_undo_redo_roundtrip() {
        let engine = engine();
        let id = engine.submit_draw(stroke(1.0)).await.unwrap();

        let undo_id = engine.undo().await.unwrap();
        assert!(undo_id.is_some());
        assert!(engine.active_ops().await.is_empty());
        assert_eq!(engine.undone_count().await, 1);

        let redo_id = engine.redo().await.unwrap();
        assert!(redo_id.is_some());
        let active = engine.active_ops().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, id);
    }

    #[tokio::test]
    async fn test_undo_on_empty_canvas() {
        let engine = engine();
        assert!(engine.undo().await.unwrap().is_none());
        assert!(engine.redo().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_empties_both_stacks() {
        let engine = engine();
        engine.submit_draw(stroke(1.0)).await.unwrap();
        engine.submit_draw(stroke(2.0)).await.unwrap();
        engine.undo().await.unwrap();

        engine.submit_clear().await.unwrap();

        assert!(engine.active_ops().await.is_empty());
        assert_eq!(engine.undone_count().await, 0);
        // Nothing left to redo after a clear.
        assert!(engine.redo().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_submit_rejects_malformed() {
        let engine = engine();
        let empty = Stroke::pen(vec![], 2.0, [0.0, 0.0, 0.0, 1.0]);

        let result = engine.submit_draw(empty).await;
        assert!(matches!(result, Err(SyncError::Validation(_))));
        assert!(engine.active_ops().await.is_empty());
    }

    #[tokio::test]
    async fn test_presence_offline_noop() {
        let engine = engine();
        engine
            .send_presence(PresenceUpdate::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_ping_offline_errors() {
        let engine = engine();
        assert!(matches!(
            engine.send_ping().await,
            Err(SyncError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_keeps_replica() {
        let mut engine = engine();
        let id = engine.submit_draw(stroke(1.0)).await.unwrap();

        engine.disconnect().await;

        assert_eq!(engine.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(engine.active_ops().await[0].id, id);
        assert!(engine.has_unconfirmed().await);
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut engine = engine();
        assert!(engine.take_event_rx().is_some());
        assert!(engine.take_event_rx().is_none());
    }
}
