//! Persistent file-backed KV store with WAL and checkpoint support.
//!
//! Uses an in-memory BTreeMap as read cache, a write-ahead log (WAL) for durability,
//! and checkpoint files for fast recovery. Every mutation is fsynced before the call
//! returns.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::kvstore::{BatchOp, Key, KvPair, KvStore, MemoryKvStore, Value};

const WAL_FILENAME: &str = "wal.bin";
const CHECKPOINT_FILENAME: &str = "checkpoint.bin";

/// WAL size past which a mutation folds the log into a checkpoint.
pub const DEFAULT_WAL_LIMIT: u64 = 8 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize, Clone)]
enum WalOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    Batch { ops: Vec<WalOp> },
    Clear,
}

impl WalOp {
    fn into_batch_ops(self, out: &mut Vec<BatchOp>) -> bool {
        match self {
            WalOp::Put { key, value } => out.push(BatchOp::Put { key, value }),
            WalOp::Delete { key } => out.push(BatchOp::Delete { key }),
            WalOp::Batch { ops } => {
                for op in ops {
                    if op.into_batch_ops(out) {
                        return true;
                    }
                }
            }
            WalOp::Clear => return true,
        }
        false
    }
}

impl From<BatchOp> for WalOp {
    fn from(op: BatchOp) -> Self {
        match op {
            BatchOp::Put { key, value } => WalOp::Put { key, value },
            BatchOp::Delete { key } => WalOp::Delete { key },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WalEntry {
    seq: u64,
    op: WalOp,
}

#[derive(Debug, Serialize, Deserialize)]
struct Checkpoint {
    seq: u64,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

struct WalWriter {
    file: File,
    seq: u64,
    bytes: u64,
}

impl WalWriter {
    fn open(path: &Path, seq: u64) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let bytes = file.metadata()?.len();
        Ok(WalWriter { file, seq, bytes })
    }

    fn append(&mut self, op: WalOp) -> Result<()> {
        self.seq += 1;
        let entry = WalEntry { seq: self.seq, op };
        let encoded = bincode::serialize(&entry)
            .map_err(|e| StoreError::Internal(format!("failed to encode WAL entry: {}", e)))?;
        let len_bytes = (encoded.len() as u32).to_le_bytes();
        self.file.write_all(&len_bytes)?;
        self.file.write_all(&encoded)?;
        self.file.sync_all()?;
        self.bytes += (len_bytes.len() + encoded.len()) as u64;
        Ok(())
    }

    fn truncate(&mut self) -> std::io::Result<()> {
        self.file.set_len(0)?;
        self.file.sync_all()?;
        self.bytes = 0;
        Ok(())
    }
}

/// Persistent file-backed KV store.
///
/// On open, loads the last checkpoint and replays remaining WAL entries. A torn
/// record at the tail of the WAL (crash mid-write) is dropped and the file is
/// truncated back to the last complete record.
///
/// Once the WAL grows past its limit the next mutation writes a checkpoint and
/// empties the WAL, so disk use tracks the live data.
pub struct PersistentKvStore {
    cache: MemoryKvStore,
    wal: Mutex<WalWriter>,
    wal_limit: u64,
    dir: PathBuf,
}

impl std::fmt::Debug for PersistentKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentKvStore")
            .field("dir", &self.dir)
            .finish()
    }
}

impl PersistentKvStore {
    /// Opens or creates a persistent KV store in the given directory.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let cache = MemoryKvStore::new();
        let checkpoint_seq = load_checkpoint(&dir.join(CHECKPOINT_FILENAME), &cache)?;
        let wal_path = dir.join(WAL_FILENAME);
        let seq = replay_wal(&wal_path, &cache, checkpoint_seq)?;
        let wal = WalWriter::open(&wal_path, seq)?;

        debug!(dir = %dir.display(), seq, "opened persistent store");
        Ok(Self {
            cache,
            wal: Mutex::new(wal),
            wal_limit: DEFAULT_WAL_LIMIT,
            dir: dir.to_path_buf(),
        })
    }

    /// Sets the WAL size that triggers an automatic checkpoint.
    pub fn with_wal_limit(mut self, bytes: u64) -> Self {
        self.wal_limit = bytes;
        self
    }

    /// Current WAL size in bytes.
    pub fn wal_len(&self) -> Result<u64> {
        Ok(self.wal.lock().map_err(StoreError::poisoned)?.bytes)
    }

    /// Directory holding this store's files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes a checkpoint of the current state and truncates the WAL.
    pub fn checkpoint(&self) -> Result<()> {
        let mut wal = self.wal.lock().map_err(StoreError::poisoned)?;
        self.checkpoint_locked(&mut wal)
    }

    fn checkpoint_locked(&self, wal: &mut WalWriter) -> Result<()> {
        let checkpoint = Checkpoint {
            seq: wal.seq,
            entries: self.cache.snapshot()?,
        };
        let encoded = bincode::serialize(&checkpoint)
            .map_err(|e| StoreError::Internal(format!("failed to encode checkpoint: {}", e)))?;

        let checkpoint_path = self.dir.join(CHECKPOINT_FILENAME);
        let mut tmp_path = checkpoint_path.clone();
        tmp_path.set_extension("tmp");
        {
            let mut tmp_file = File::create(&tmp_path)?;
            tmp_file.write_all(&encoded)?;
            tmp_file.sync_all()?;
        }
        fs::rename(&tmp_path, &checkpoint_path)?;
        let folded = wal.bytes;
        wal.truncate()?;
        debug!(dir = %self.dir.display(), seq = wal.seq, folded, "checkpoint written");
        Ok(())
    }

    fn checkpoint_if_full(&self, wal: &mut WalWriter) -> Result<()> {
        if wal.bytes > self.wal_limit {
            self.checkpoint_locked(wal)?;
        }
        Ok(())
    }

    fn log_and_apply(&self, op: WalOp, ops: Vec<BatchOp>) -> Result<()> {
        let mut wal = self.wal.lock().map_err(StoreError::poisoned)?;
        wal.append(op)?;
        self.cache.apply(ops)?;
        self.checkpoint_if_full(&mut wal)
    }
}

fn load_checkpoint(path: &Path, cache: &MemoryKvStore) -> Result<u64> {
    if !path.exists() {
        return Ok(0);
    }
    let mut contents = Vec::new();
    File::open(path)?.read_to_end(&mut contents)?;
    if contents.is_empty() {
        return Ok(0);
    }
    let checkpoint: Checkpoint =
        bincode::deserialize(&contents).map_err(|e| StoreError::Corrupted {
            path: path.display().to_string(),
            msg: e.to_string(),
        })?;
    cache.apply(
        checkpoint
            .entries
            .into_iter()
            .map(|(key, value)| BatchOp::Put { key, value })
            .collect(),
    )?;
    Ok(checkpoint.seq)
}

fn replay_wal(path: &Path, cache: &MemoryKvStore, from_seq: u64) -> Result<u64> {
    if !path.exists() {
        return Ok(from_seq);
    }
    let mut file = File::open(path)?;
    let mut max_seq = from_seq;
    let mut valid_len: u64 = 0;
    let mut torn = false;

    loop {
        let mut len_buf = [0u8; 4];
        match file.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut op_buf = vec![0u8; len];
        match file.read_exact(&mut op_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                torn = true;
                break;
            }
            Err(e) => return Err(e.into()),
        }
        let entry: WalEntry = match bincode::deserialize(&op_buf) {
            Ok(entry) => entry,
            Err(_) => {
                torn = true;
                break;
            }
        };
        valid_len += 4 + len as u64;

        if entry.seq <= from_seq {
            continue;
        }
        max_seq = max_seq.max(entry.seq);

        let mut ops = Vec::new();
        if entry.op.into_batch_ops(&mut ops) {
            cache.clear()?;
        }
        cache.apply(ops)?;
    }

    if torn {
        warn!(path = %path.display(), valid_len, "dropping torn WAL tail");
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(valid_len)?;
        file.sync_all()?;
    }
    Ok(max_seq)
}

impl KvStore for PersistentKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        self.cache.get(key)
    }

    fn put(&self, key: Key, value: Value) -> Result<()> {
        let op = WalOp::Put {
            key: key.clone(),
            value: value.clone(),
        };
        self.log_and_apply(op, vec![BatchOp::Put { key, value }])
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        let op = WalOp::Delete { key: key.to_vec() };
        self.log_and_apply(op, vec![BatchOp::Delete { key: key.to_vec() }])
    }

    fn delete_range(&self, start: &[u8], end: &[u8]) -> Result<usize> {
        let mut wal = self.wal.lock().map_err(StoreError::poisoned)?;
        let keys = self.cache.keys_in_range(start, end)?;
        if keys.is_empty() {
            return Ok(0);
        }
        let removed = keys.len();
        let ops: Vec<BatchOp> = keys.into_iter().map(|key| BatchOp::Delete { key }).collect();
        wal.append(WalOp::Batch {
            ops: ops.iter().cloned().map(WalOp::from).collect(),
        })?;
        self.cache.apply(ops)?;
        self.checkpoint_if_full(&mut wal)?;
        Ok(removed)
    }

    fn scan_range(&self, start: &[u8], end: &[u8]) -> Result<Vec<KvPair>> {
        self.cache.scan_range(start, end)
    }

    fn seek(&self, lower: Bound<&[u8]>) -> Result<Option<KvPair>> {
        self.cache.seek(lower)
    }

    fn seek_back(&self, upper: Bound<&[u8]>) -> Result<Option<KvPair>> {
        self.cache.seek_back(upper)
    }

    fn len(&self) -> Result<usize> {
        self.cache.len()
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        let op = WalOp::Batch {
            ops: ops.iter().cloned().map(WalOp::from).collect(),
        };
        self.log_and_apply(op, ops)
    }

    fn sync(&self) -> Result<()> {
        self.checkpoint()
    }

    fn clear(&self) -> Result<()> {
        let mut wal = self.wal.lock().map_err(StoreError::poisoned)?;
        wal.append(WalOp::Clear)?;
        self.cache.clear()?;
        self.checkpoint_if_full(&mut wal)
    }
}
