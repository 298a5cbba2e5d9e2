//! RocksDB-backed append-only operation log.
//!
//! Column families:
//! - `ops`   — operation records, LZ4 compressed, keyed by
//!             `room_id (16B) ‖ sequence (8B big-endian)` so a prefix
//!             scan yields one room's history in sequence order
//! - `rooms` — per-room metadata (sequence watermark, sizes, times)
//!
//! Sequences are per-room, contiguous from 0, and assigned under a
//! single counter per room — the single-writer sequencer discipline the
//! sync protocol relies on. Counters are rebuilt from room metadata on
//! open; each append writes record and metadata in one atomic batch
//! while still holding the room's counter, so the recovered counter
//! always sits exactly at the stored tail.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use uuid::Uuid;

use mural_core::OperationRecord;

const CF_OPS: &str = "ops";
const CF_ROOMS: &str = "rooms";

const COLUMN_FAMILIES: &[&str] = &[CF_OPS, CF_ROOMS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 128MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every write (default: false — RocksDB WAL covers crashes)
    pub sync_writes: bool,
    /// Max open files (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("mural_data"),
            block_cache_size: 128 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Per-room bookkeeping stored in the `rooms` column family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomMetadata {
    pub room_id: Uuid,
    /// Number of operations appended; also the next sequence number.
    pub op_count: u64,
    /// Total compressed bytes in the `ops` column family for this room.
    pub bytes_stored: u64,
    /// Seconds since epoch.
    pub created_at: u64,
    pub updated_at: u64,
}

impl RoomMetadata {
    fn new(room_id: Uuid) -> Self {
        let now = epoch_secs();
        Self {
            room_id,
            op_count: 0,
            bytes_stored: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, LogError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| LogError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, LogError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| LogError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

/// Durable log errors.
#[derive(Debug, Clone)]
pub enum LogError {
    Database(String),
    RoomNotFound(Uuid),
    Serialization(String),
    Deserialization(String),
    Compression(String),
}

impl std::fmt::Display for LogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogError::Database(e) => write!(f, "database error: {e}"),
            LogError::RoomNotFound(id) => write!(f, "room not found: {id}"),
            LogError::Serialization(e) => write!(f, "serialization error: {e}"),
            LogError::Deserialization(e) => write!(f, "deserialization error: {e}"),
            LogError::Compression(e) => write!(f, "compression error: {e}"),
        }
    }
}

impl std::error::Error for LogError {}

impl From<rocksdb::Error> for LogError {
    fn from(e: rocksdb::Error) -> Self {
        LogError::Database(e.to_string())
    }
}

/// The authoritative append-only operation log.
pub struct OpLog {
    /// RocksDB instance (single-threaded handle mode — callers serialize
    /// through tokio, reads/writes take `&self`)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Next sequence per room, rebuilt from metadata on open.
    sequences: Mutex<HashMap<Uuid, u64>>,
}

impl OpLog {
    /// Open (or create) the log at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, LogError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let sequences = Mutex::new(Self::recover_sequences(&db)?);

        Ok(Self { db, config, sequences })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_OPS => {
                // Many small appends, prefix-scanned by room on join.
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_ROOMS => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Rebuild the per-room sequence counters from stored metadata.
    fn recover_sequences(
        db: &DBWithThreadMode<SingleThreaded>,
    ) -> Result<HashMap<Uuid, u64>, LogError> {
        let cf = db
            .cf_handle(CF_ROOMS)
            .ok_or_else(|| LogError::Database("missing 'rooms' column family".into()))?;

        let mut sequences = HashMap::new();
        for item in db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item.map_err(|e| LogError::Database(e.to_string()))?;
            let meta = RoomMetadata::decode(&value)?;
            sequences.insert(meta.room_id, meta.op_count);
        }
        Ok(sequences)
    }

    // ─── Rooms ────────────────────────────────────────────────────────

    /// Create the room if it does not exist. Idempotent.
    pub fn ensure_room(&self, room_id: Uuid) -> Result<(), LogError> {
        let cf = self.cf(CF_ROOMS)?;
        if self.db.get_cf(&cf, room_id.as_bytes())?.is_some() {
            return Ok(());
        }

        let meta = RoomMetadata::new(room_id);
        self.db.put_cf(&cf, room_id.as_bytes(), meta.encode()?)?;
        self.lock_sequences()?.entry(room_id).or_insert(0);
        log::info!("created room {room_id}");
        Ok(())
    }

    pub fn room_exists(&self, room_id: Uuid) -> Result<bool, LogError> {
        let cf = self.cf(CF_ROOMS)?;
        Ok(self.db.get_cf(&cf, room_id.as_bytes())?.is_some())
    }

    pub fn metadata(&self, room_id: Uuid) -> Result<RoomMetadata, LogError> {
        let cf = self.cf(CF_ROOMS)?;
        match self.db.get_cf(&cf, room_id.as_bytes())? {
            Some(bytes) => RoomMetadata::decode(&bytes),
            None => Err(LogError::RoomNotFound(room_id)),
        }
    }

    pub fn list_rooms(&self) -> Result<Vec<Uuid>, LogError> {
        let cf = self.cf(CF_ROOMS)?;
        let mut rooms = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item.map_err(|e| LogError::Database(e.to_string()))?;
            rooms.push(RoomMetadata::decode(&value)?.room_id);
        }
        Ok(rooms)
    }

    // ─── The log ──────────────────────────────────────────────────────

    /// Append an operation, assigning the room's next sequence.
    ///
    /// The stored record carries the assigned sequence, which is also
    /// returned for the ack. Record and metadata go into one atomic
    /// batch, committed under the room's counter so concurrent appends
    /// serialize fully.
    pub fn append(&self, room_id: Uuid, op: &OperationRecord) -> Result<u64, LogError> {
        self.ensure_room(room_id)?;

        let cf_ops = self.cf(CF_OPS)?;
        let cf_rooms = self.cf(CF_ROOMS)?;

        // The counter lock is held across the metadata update and the
        // batch commit. Released earlier, a concurrent append could
        // read the watermark before this one lands, the recovered
        // counter would fall behind the tail on reopen, and a later
        // append would silently overwrite a stored record.
        let mut seqs = self.lock_sequences()?;
        let next = seqs.entry(room_id).or_insert(0);
        let sequence = *next;

        let sequenced = op.clone().with_sequence(sequence);
        let encoded = bincode::serde::encode_to_vec(&sequenced, bincode::config::standard())
            .map_err(|e| LogError::Serialization(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);

        let mut meta = self
            .metadata(room_id)
            .unwrap_or_else(|_| RoomMetadata::new(room_id));
        meta.op_count = sequence + 1;
        meta.bytes_stored += compressed.len() as u64;
        meta.updated_at = epoch_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_ops, op_key(room_id, sequence), &compressed);
        batch.put_cf(&cf_rooms, room_id.as_bytes(), meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        // Bump only after the commit: a failed write leaves the
        // sequence unburned for the retry.
        *next += 1;
        Ok(sequence)
    }

    /// Read a room's full history in ascending sequence order.
    ///
    /// Undecodable entries are skipped with a diagnostic rather than
    /// poisoning the replay — a corrupt record must never crash a fold.
    pub fn list_ordered(&self, room_id: Uuid) -> Result<Vec<OperationRecord>, LogError> {
        self.list_from(room_id, 0)
    }

    /// Read a room's history starting at `from_sequence` (inclusive).
    pub fn list_from(
        &self,
        room_id: Uuid,
        from_sequence: u64,
    ) -> Result<Vec<OperationRecord>, LogError> {
        let cf = self.cf(CF_OPS)?;
        let start = op_key(room_id, from_sequence);

        let mut ops = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start, rocksdb::Direction::Forward));

        for item in iter {
            let (key, value) = item.map_err(|e| LogError::Database(e.to_string()))?;
            if key.len() < 24 || &key[..16] != room_id.as_bytes() {
                break;
            }

            match decode_record(&value) {
                Ok(op) => ops.push(op),
                Err(e) => {
                    let seq = u64::from_be_bytes(key[16..24].try_into().unwrap_or([0; 8]));
                    log::warn!("skipping corrupt log entry {room_id}:{seq}: {e}");
                }
            }
        }

        Ok(ops)
    }

    /// Number of operations appended to a room (0 for unknown rooms).
    pub fn op_count(&self, room_id: Uuid) -> Result<u64, LogError> {
        match self.metadata(room_id) {
            Ok(meta) => Ok(meta.op_count),
            Err(LogError::RoomNotFound(_)) => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// The sequence the next append to this room will receive.
    pub fn next_sequence(&self, room_id: Uuid) -> Result<u64, LogError> {
        Ok(self.lock_sequences()?.get(&room_id).copied().unwrap_or(0))
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), LogError> {
        self.db.flush().map_err(|e| LogError::Database(e.to_string()))
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, LogError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| LogError::Database(format!("column family '{name}' not found")))
    }

    fn lock_sequences(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Uuid, u64>>, LogError> {
        self.sequences
            .lock()
            .map_err(|_| LogError::Database("sequence counter lock poisoned".into()))
    }
}

/// `room_id (16B) ‖ sequence (8B BE)` — sorts by room, then sequence.
fn op_key(room_id: Uuid, sequence: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(room_id.as_bytes());
    key.extend_from_slice(&sequence.to_be_bytes());
    key
}

fn decode_record(compressed: &[u8]) -> Result<OperationRecord, LogError> {
    let encoded = lz4_flex::decompress_size_prepended(compressed)
        .map_err(|e| LogError::Compression(e.to_string()))?;
    let (op, _) = bincode::serde::decode_from_slice(&encoded, bincode::config::standard())
        .map_err(|e| LogError::Deserialization(e.to_string()))?;
    Ok(op)
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
