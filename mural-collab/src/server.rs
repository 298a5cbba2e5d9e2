//! WebSocket relay server: the room sequencer.
//!
//! Architecture:
//! ```text
//! Replica A ──┐
//!             ├── Room (room_id) ── BroadcastGroup
//! Replica B ──┘          │
//!                        ▼
//!                  OpLog (RocksDB)
//!                        │ assigns log_sequence
//!          ┌─────────────┼─────────────┐
//!          ▼             ▼             ▼
//!      Ack to origin  Operation to  history for
//!                     the room      late joiners
//! ```
//!
//! The server owns the durable log, so every submit is sequenced by a
//! single writer per room. Fan-out after the append is best-effort: a
//! dropped broadcast is repaired by the next join's full replay, never
//! by a server-side retry.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, RoomManager};
use crate::protocol::{ClientMessage, ServerMessage, UserProfile};
use crate::storage::{LogError, OpLog, StoreConfig};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast buffer per receiver, in frames
    pub broadcast_capacity: usize,
    /// Durable log directory
    pub storage_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9400".to_string(),
            broadcast_capacity: 256,
            storage_path: PathBuf::from("mural_data"),
        }
    }
}

/// Server-wide counters.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub appended_ops: u64,
    pub rejected_ops: u64,
    pub active_rooms: usize,
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    log: Arc<OpLog>,
    stats: Arc<RwLock<ServerStats>>,
}

impl RelayServer {
    /// Open the durable log and build the server.
    pub fn open(config: ServerConfig) -> Result<Self, LogError> {
        let store_config = StoreConfig {
            path: config.storage_path.clone(),
            ..StoreConfig::default()
        };
        let log = Arc::new(OpLog::open(store_config)?);
        let rooms = Arc::new(RoomManager::new(config.broadcast_capacity));

        Ok(Self {
            config,
            rooms,
            log,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        })
    }

    /// Open with defaults except for bind address and storage path.
    pub fn with_storage(
        bind_addr: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Result<Self, LogError> {
        Self::open(ServerConfig {
            bind_addr: bind_addr.into(),
            storage_path: path.into(),
            ..ServerConfig::default()
        })
    }

    /// Accept loop. Call from an async runtime; runs until the listener
    /// fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!(
            "relay server listening on {} ({} known rooms)",
            self.config.bind_addr,
            self.log.list_rooms().map(|r| r.len()).unwrap_or(0)
        );

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let log = self.log.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_session(stream, addr, rooms, log, stats).await {
                    log::error!("session error from {addr}: {e}");
                }
            });
        }
    }

    /// One WebSocket session, from handshake to cleanup.
    async fn handle_session(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RoomManager>,
        log: Arc<OpLog>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket session established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Session state, populated by the Join message.
        let mut user: Option<UserProfile> = None;
        let mut room_id: Option<Uuid> = None;
        let mut group: Option<Arc<BroadcastGroup>> = None;
        let mut broadcast_rx: Option<tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>> = None;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            let client_msg = match ClientMessage::decode(&bytes) {
                                Ok(m) => m,
                                Err(e) => {
                                    log::warn!("undecodable frame from {addr}: {e}");
                                    continue;
                                }
                            };

                            match client_msg {
                                ClientMessage::Join { room_id: rid, profile } => {
                                    // Room switch on a live session: leave the old
                                    // room exactly as a disconnect would, so its
                                    // group does not keep a stale user forever.
                                    if let (Some(prev), Some(prev_room)) = (user.take(), group.take()) {
                                        prev_room.remove_user(&prev.user_id).await;
                                        let _ = prev_room.send(&ServerMessage::UserLeft {
                                            user_id: prev.user_id,
                                        });
                                        if let Some(prev_rid) = room_id.take() {
                                            rooms.remove_if_empty(&prev_rid).await;
                                        }
                                    }

                                    log.ensure_room(rid)?;

                                    let room = rooms.get_or_create(rid).await;
                                    // Subscribe before reading the history so an op
                                    // sequenced during the read is buffered, not lost.
                                    // Duplicates are the replica's seen-set's problem.
                                    broadcast_rx = Some(room.add_user(profile.clone()).await);

                                    let ops = log.list_ordered(rid)?;
                                    let history = ServerMessage::History { room_id: rid, ops };
                                    ws_sender.send(Message::Binary(history.encode()?.into())).await?;

                                    let _ = room.send(&ServerMessage::UserJoined {
                                        profile: profile.clone(),
                                    });

                                    log::info!(
                                        "user {} ({}) joined room {rid}",
                                        profile.name, profile.user_id
                                    );

                                    user = Some(profile);
                                    room_id = Some(rid);
                                    group = Some(room);
                                    {
                                        let mut s = stats.write().await;
                                        s.active_rooms = rooms.room_count().await;
                                    }
                                }

                                ClientMessage::Submit { op } => {
                                    let (Some(rid), Some(room)) = (room_id, group.as_ref()) else {
                                        log::warn!("submit from {addr} before join, dropping");
                                        continue;
                                    };

                                    if let Err(e) = op.validate() {
                                        log::warn!(
                                            "rejecting malformed {} op {} from {addr}: {e}",
                                            op.kind.name(), op.id
                                        );
                                        stats.write().await.rejected_ops += 1;
                                        let reject = ServerMessage::Error {
                                            message: format!("rejected {}: {e}", op.id),
                                        };
                                        ws_sender.send(Message::Binary(reject.encode()?.into())).await?;
                                        continue;
                                    }

                                    match log.append(rid, &op) {
                                        Ok(sequence) => {
                                            stats.write().await.appended_ops += 1;

                                            let ack = ServerMessage::Ack { op_id: op.id, sequence };
                                            ws_sender.send(Message::Binary(ack.encode()?.into())).await?;

                                            // Best-effort fan-out; the log already has it.
                                            let sequenced = op.with_sequence(sequence);
                                            let _ = room.send(&ServerMessage::Operation { op: sequenced });
                                        }
                                        Err(e) => {
                                            log::error!("append failed for room {rid}: {e}");
                                            let err = ServerMessage::Error {
                                                message: format!("append failed: {e}"),
                                            };
                                            ws_sender.send(Message::Binary(err.encode()?.into())).await?;
                                        }
                                    }
                                }

                                ClientMessage::Presence { update } => {
                                    if let (Some(profile), Some(room)) = (user.as_ref(), group.as_ref()) {
                                        let _ = room.send(&ServerMessage::Presence {
                                            user_id: profile.user_id,
                                            update,
                                        });
                                    }
                                }

                                ClientMessage::Ping => {
                                    ws_sender
                                        .send(Message::Binary(ServerMessage::Pong.encode()?.into()))
                                        .await?;
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("session closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                frame = async {
                    match broadcast_rx {
                        Some(ref mut rx) => rx.recv().await,
                        // Not joined yet — park this arm.
                        None => std::future::pending().await,
                    }
                } => {
                    match frame {
                        Ok(frame) => {
                            // Don't echo a replica's own traffic back to it.
                            if let Ok(server_msg) = ServerMessage::decode(&frame) {
                                let own = user.as_ref().map(|p| p.user_id);
                                if server_msg.origin() == own && own.is_some() {
                                    continue;
                                }
                            }
                            ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            // At-most-once channel: dropped frames are repaired
                            // by the replica's next full replay.
                            log::warn!("receiver for {addr} lagged by {n} frames");
                        }
                        Err(_) => break,
                    }
                }
            }
        }

        // Cleanup: leave the room, tell the others, drop empty rooms.
        if let (Some(profile), Some(rid), Some(room)) = (user, room_id, group) {
            room.remove_user(&profile.user_id).await;
            let _ = room.send(&ServerMessage::UserLeft { user_id: profile.user_id });

            if rooms.remove_if_empty(&rid).await {
                log::info!("room {rid} idle, fan-out group dropped");
            }
        }

        let mut s = stats.write().await;
        s.active_connections -= 1;
        s.active_rooms = rooms.room_count().await;

        Ok(())
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// The durable log backing this server.
    pub fn op_log(&self) -> &Arc<OpLog> {
        &self.log
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9400");
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.storage_path, PathBuf::from("mural_data"));
    }

    #[test]
    fn test_server_open() {
        let dir = tempfile::tempdir().unwrap();
        let server = RelayServer::with_storage("127.0.0.1:0", dir.path().join("db")).unwrap();
        assert_eq!(server.bind_addr(), "127.0.0.1:0");
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let dir = tempfile::tempdir().unwrap();
        let server = RelayServer::with_storage("127.0.0.1:0", dir.path().join("db")).unwrap();

        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.appended_ops, 0);
        assert_eq!(stats.rejected_ops, 0);
        assert_eq!(stats.active_rooms, 0);
    }

    #[test]
    fn test_server_reuses_existing_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let room = Uuid::new_v4();

        {
            let server = RelayServer::with_storage("127.0.0.1:0", &path).unwrap();
            server.op_log().ensure_room(room).unwrap();
        }

        let server = RelayServer::with_storage("127.0.0.1:0", &path).unwrap();
        assert!(server.op_log().room_exists(room).unwrap());
    }
}
