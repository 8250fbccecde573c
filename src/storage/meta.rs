//! Ordered, transactional key-value store for file metadata.
//!
//! Keys are logical paths kept in a `BTreeMap`, so iteration is byte-lexicographic and
//! every prefix forms one contiguous range. Readers work on an `Arc` snapshot of the
//! committed map and never wait for a writer beyond the pointer swap; writers are
//! serialized behind a single mutex and see their own uncommitted puts layered over the
//! snapshot they started from.
//!
//! Durability: when opened on a directory, each commit is appended to `wal.lg` before it
//! becomes visible. `checkpoint()` folds the map into `snapshot.bin` and empties the log.

pub mod wal;

use std::cmp::Ordering;
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::iter::Peekable;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use self::wal::{WalReader, WalWriter};
use super::StoreError;

pub type KeyMap = BTreeMap<String, Vec<u8>>;

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct MetaSettings {
    /// fsync the log on every commit.
    #[serde(default = "MetaSettings::default_sync")]
    pub sync_on_commit: bool,
    /// Checkpoint automatically once the log grows past this many bytes (0 disables).
    #[serde(default = "MetaSettings::default_checkpoint_bytes")]
    pub checkpoint_bytes: u64,
}

impl MetaSettings {
    fn default_sync() -> bool { true }
    fn default_checkpoint_bytes() -> u64 { 16 * 1024 * 1024 }
}

impl Default for MetaSettings {
    fn default() -> Self {
        Self { sync_on_commit: Self::default_sync(), checkpoint_bytes: Self::default_checkpoint_bytes() }
    }
}

/// Read access shared by snapshots and write transactions.
pub trait KvRead {
    fn get(&self, key: &str) -> Option<&[u8]>;

    /// Iterate keys `>= from` in order.
    fn seek<'a>(&'a self, from: &str) -> Box<dyn Iterator<Item = (&'a str, &'a [u8])> + 'a>;

    /// Iterate the contiguous range of keys starting with `prefix`.
    fn scan_prefix<'a>(&'a self, prefix: &'a str) -> Box<dyn Iterator<Item = (&'a str, &'a [u8])> + 'a> {
        Box::new(self.seek(prefix).take_while(move |(k, _)| k.starts_with(prefix)))
    }
}

fn range_from<'a>(map: &'a KeyMap, from: &str) -> btree_map::Range<'a, String, Vec<u8>> {
    map.range::<str, _>((Bound::Included(from), Bound::Unbounded))
}

/// Point-in-time view of the committed map.
#[derive(Clone)]
pub struct ReadTxn {
    map: Arc<KeyMap>,
}

impl ReadTxn {
    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
}

impl KvRead for ReadTxn {
    fn get(&self, key: &str) -> Option<&[u8]> {
        self.map.get(key).map(|v| v.as_slice())
    }

    fn seek<'a>(&'a self, from: &str) -> Box<dyn Iterator<Item = (&'a str, &'a [u8])> + 'a> {
        Box::new(range_from(&self.map, from).map(|(k, v)| (k.as_str(), v.as_slice())))
    }
}

/// Buffered writes over the snapshot the transaction started from. Dropping it without
/// committing discards every put.
pub struct WriteTxn {
    base: Arc<KeyMap>,
    pending: KeyMap,
}

impl WriteTxn {
    pub fn put(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.pending.insert(key.into(), value);
    }
}

impl KvRead for WriteTxn {
    fn get(&self, key: &str) -> Option<&[u8]> {
        self.pending.get(key).or_else(|| self.base.get(key)).map(|v| v.as_slice())
    }

    fn seek<'a>(&'a self, from: &str) -> Box<dyn Iterator<Item = (&'a str, &'a [u8])> + 'a> {
        Box::new(MergeRange {
            base: range_from(&self.base, from).peekable(),
            pending: range_from(&self.pending, from).peekable(),
        })
    }
}

/// Ordered union of two ranges; on equal keys the pending value wins.
struct MergeRange<'a> {
    base: Peekable<btree_map::Range<'a, String, Vec<u8>>>,
    pending: Peekable<btree_map::Range<'a, String, Vec<u8>>>,
}

enum Pick { Base, Pending, Both }

impl<'a> Iterator for MergeRange<'a> {
    type Item = (&'a str, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let pick = match (self.base.peek(), self.pending.peek()) {
            (None, None) => return None,
            (Some(_), None) => Pick::Base,
            (None, Some(_)) => Pick::Pending,
            (Some((bk, _)), Some((pk, _))) => match bk.as_str().cmp(pk.as_str()) {
                Ordering::Less => Pick::Base,
                Ordering::Greater => Pick::Pending,
                Ordering::Equal => Pick::Both,
            },
        };
        let (k, v) = match pick {
            Pick::Base => self.base.next()?,
            Pick::Pending => self.pending.next()?,
            Pick::Both => { self.base.next(); self.pending.next()? }
        };
        Some((k.as_str(), v.as_slice()))
    }
}

#[derive(Serialize, Deserialize)]
struct Snapshot { version: u32, created_ms: i64, last_txn_id: u64, entries: Vec<(String, Vec<u8>)> }

struct Writer {
    wal: Option<WalWriter>,
    next_txn_id: u64,
}

struct Inner {
    committed: RwLock<Arc<KeyMap>>,
    writer: Mutex<Writer>,
    settings: MetaSettings,
    dir: Option<PathBuf>,
}

/// Handle to one metadata keyspace. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MetaStore {
    inner: Arc<Inner>,
}

impl MetaStore {
    /// Volatile store (tests, ephemeral runs): same transaction semantics, no log.
    pub fn in_memory() -> Self {
        Self::from_parts(KeyMap::new(), None, 1, None, MetaSettings::default())
    }

    fn from_parts(map: KeyMap, wal: Option<WalWriter>, next_txn_id: u64, dir: Option<PathBuf>, settings: MetaSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                committed: RwLock::new(Arc::new(map)),
                writer: Mutex::new(Writer { wal, next_txn_id }),
                settings,
                dir,
            }),
        }
    }

    fn snapshot_path(dir: &Path) -> PathBuf { dir.join("snapshot.bin") }
    fn wal_path(dir: &Path) -> PathBuf { dir.join("wal.lg") }

    /// Open (or create) a durable store under `dir`: load the snapshot, replay committed
    /// log transactions, and cut any torn tail.
    pub fn open(dir: impl AsRef<Path>, settings: MetaSettings) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut map = KeyMap::new();
        let mut last_txn_id = 0u64;
        let snap_path = Self::snapshot_path(&dir);
        if snap_path.exists() {
            let bytes = std::fs::read(&snap_path)?;
            let snap: Snapshot = bincode::deserialize(&bytes)?;
            last_txn_id = snap.last_txn_id;
            map.extend(snap.entries);
            debug!(target: "docmirror::meta", "loaded snapshot: entries={} last_txn_id={}", map.len(), last_txn_id);
        }

        let wal_path = Self::wal_path(&dir);
        let mut replayed = 0usize;
        let mut wal = WalWriter::open(&wal_path)?;
        let recovered = WalReader::open(&wal_path)?.recover()?;
        for txn in recovered.committed {
            if txn.txn_id <= last_txn_id { continue; }
            last_txn_id = txn.txn_id;
            for (k, v) in txn.puts { map.insert(k, v); }
            replayed += 1;
        }
        if recovered.torn {
            warn!(target: "docmirror::meta", "discarding torn metadata log tail after byte {} in {}", recovered.valid_len, wal_path.display());
            wal.truncate_to(recovered.valid_len)?;
        }
        info!(target: "docmirror::meta", "metadata store open: dir='{}' records={} replayed_txns={}", dir.display(), map.len(), replayed);
        Ok(Self::from_parts(map, Some(wal), last_txn_id + 1, Some(dir), settings))
    }

    /// Point-in-time read view.
    pub fn snapshot(&self) -> ReadTxn {
        ReadTxn { map: self.inner.committed.read().clone() }
    }

    /// Run `f` against a snapshot.
    pub fn view<T, E>(&self, f: impl FnOnce(&ReadTxn) -> Result<T, E>) -> Result<T, E> {
        let snap = self.snapshot();
        f(&snap)
    }

    /// Run `f` in a write transaction. If `f` fails nothing is persisted or published; if it
    /// succeeds its puts are logged and then made visible atomically.
    pub fn update<T, E>(&self, f: impl FnOnce(&mut WriteTxn) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let mut w = self.inner.writer.lock();
        let base = self.inner.committed.read().clone();
        let mut txn = WriteTxn { base, pending: KeyMap::new() };
        let out = f(&mut txn)?;
        let WriteTxn { base, pending } = txn;
        drop(base);
        if pending.is_empty() { return Ok(out); }

        let txn_id = w.next_txn_id;
        if let Some(wal) = w.wal.as_mut() {
            wal.append_txn(txn_id, &pending, self.inner.settings.sync_on_commit)?;
        }
        w.next_txn_id += 1;
        let n = pending.len();
        {
            let mut guard = self.inner.committed.write();
            let map = Arc::make_mut(&mut *guard);
            for (k, v) in pending { map.insert(k, v); }
        }
        debug!(target: "docmirror::meta", "commit txn={} puts={}", txn_id, n);

        let threshold = self.inner.settings.checkpoint_bytes;
        let over = threshold > 0 && w.wal.as_ref().and_then(|wal| wal.len().ok()).map(|l| l >= threshold).unwrap_or(false);
        if over {
            if let Err(e) = self.checkpoint_locked(&mut w) {
                warn!(target: "docmirror::meta", "automatic checkpoint failed: {}", e);
            }
        }
        Ok(out)
    }

    /// Fold the committed map into `snapshot.bin` and empty the log.
    pub fn checkpoint(&self) -> Result<(), StoreError> {
        let mut w = self.inner.writer.lock();
        self.checkpoint_locked(&mut w)
    }

    fn checkpoint_locked(&self, w: &mut Writer) -> Result<(), StoreError> {
        let Some(dir) = self.inner.dir.as_ref() else { return Ok(()); };
        let map = self.inner.committed.read().clone();
        let created_ms = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0);
        let snap = Snapshot {
            version: 1,
            created_ms,
            last_txn_id: w.next_txn_id.saturating_sub(1),
            entries: map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        };
        let bytes = bincode::serialize(&snap)?;
        let path = Self::snapshot_path(dir);
        let tmp = path.with_extension("bin.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::File::open(&tmp)?.sync_all()?;
        std::fs::rename(&tmp, &path)?;
        if let Some(wal) = w.wal.as_mut() { wal.truncate()?; }
        info!(target: "docmirror::meta", "checkpoint written: records={} last_txn_id={}", snap.entries.len(), snap.last_txn_id);
        Ok(())
    }

    pub fn len(&self) -> usize { self.inner.committed.read().len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[cfg(test)]
#[path = "meta_tests.rs"]
mod meta_tests;
