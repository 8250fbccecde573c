//! `FileStorage`: the public storage API.
//!
//! Every public method is atomic on its own: reads run on one metadata snapshot, and
//! every mutation happens inside exactly one metadata write transaction (existence checks
//! included). No atomicity is offered across calls.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use super::meta::{KvRead, MetaSettings, MetaStore, WriteTxn};
use super::paths::{ancestors, clean_logical_path, join_logical, split_parent, validate_logical_path};
use super::physical::{LocalDir, MemoryStore, PhysicalStore};
use super::record::{is_valid_token, FileRecord, DIR_PLACEHOLDER};
use super::tree::{self, Listing, PathStat};
use super::{FsError, FsResult};
use crate::notify::{ConfirmationRequest, NotificationQueue};

/// Result of confirming a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    /// Records flipped to authorized by this call.
    pub confirmed: usize,
    /// Owner of the records carrying the token.
    pub email: Option<String>,
}

#[derive(Clone)]
pub struct FileStorage {
    physical: Arc<dyn PhysicalStore>,
    meta: MetaStore,
    notifications: Option<NotificationQueue>,
}

impl FileStorage {
    pub fn new(physical: Arc<dyn PhysicalStore>, meta: MetaStore) -> Self {
        Self { physical, meta, notifications: None }
    }

    /// Content in memory, metadata in memory.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), MetaStore::in_memory())
    }

    /// Content under `base_dir`, durable metadata under `meta_dir`.
    pub fn open(base_dir: impl AsRef<Path>, meta_dir: impl AsRef<Path>, settings: MetaSettings) -> FsResult<Self> {
        let meta = MetaStore::open(meta_dir, settings)?;
        Ok(Self::new(Arc::new(LocalDir::new(base_dir)), meta))
    }

    /// Enqueue a confirmation request after every successful upload.
    pub fn with_notifications(mut self, queue: NotificationQueue) -> Self {
        self.notifications = Some(queue);
        self
    }

    pub fn physical(&self) -> &dyn PhysicalStore { self.physical.as_ref() }
    pub fn meta(&self) -> &MetaStore { &self.meta }

    /// Classify a path as a file (with its record) or a directory; `NotFound` if it is
    /// neither. No authorization filter.
    pub fn stat(&self, path: &str) -> FsResult<PathStat> {
        let clean = clean_logical_path(path)?;
        match self.meta.view(|snap| tree::stat(snap, &clean))? {
            PathStat::Missing => Err(FsError::NotFound(path.to_string())),
            other => Ok(other),
        }
    }

    /// Immediate children of `path`. A path that is not a directory lists as empty.
    pub fn list(&self, path: &str) -> FsResult<Listing> {
        let path = clean_logical_path(path)?;
        self.meta.view(|snap| tree::list(snap, &path))
    }

    /// Stat as seen by anonymous readers: pending uploads and placeholders do not exist.
    pub fn stat_public(&self, path: &str) -> FsResult<PathStat> {
        match self.stat(path)? {
            PathStat::File(rec) if !rec.is_public() => Err(FsError::NotFound(path.to_string())),
            other => Ok(other),
        }
    }

    /// Directory listing as seen by anonymous readers.
    pub fn list_public(&self, path: &str) -> FsResult<Listing> {
        let clean = clean_logical_path(path)?;
        self.meta.view(|snap| match tree::stat(snap, &clean)? {
            PathStat::Directory => Ok(tree::list(snap, &clean)?.public()),
            _ => Err(FsError::NotFound(path.to_string())),
        })
    }

    /// Open stored content together with its record.
    pub fn open_content(&self, path: &str) -> FsResult<(FileRecord, Box<dyn Read + Send>)> {
        let clean = clean_logical_path(path)?;
        let rec = match self.meta.view(|snap| tree::stat(snap, &clean))? {
            PathStat::File(rec) => rec,
            _ => return Err(FsError::NotFound(path.to_string())),
        };
        let reader = self.physical.open(&clean).map_err(|e| FsError::from_io(&clean, e))?;
        Ok((rec, reader))
    }

    /// Open content only if it is publicly servable.
    pub fn open_public(&self, path: &str) -> FsResult<(FileRecord, Box<dyn Read + Send>)> {
        let (rec, reader) = self.open_content(path)?;
        if !rec.is_public() {
            return Err(FsError::NotFound(path.to_string()));
        }
        Ok((rec, reader))
    }

    /// Store an upload as a pending record. The uniqueness check, the content write and the
    /// insert share one write transaction, so concurrent uploads to the same path cannot both
    /// win. Returns the new record (carrying its confirmation token).
    pub fn create(&self, directory: &str, filename: &str, owner_email: &str, content: &mut dyn Read) -> FsResult<FileRecord> {
        let path = join_logical(directory, filename)?;
        let rec = self.meta.update(|tx| -> FsResult<FileRecord> {
            ensure_vacant(tx, &path)?;

            let mut w = self.physical.create(&path).map_err(|e| FsError::from_io(&path, e))?;
            let size = std::io::copy(content, &mut w).map_err(|e| FsError::from_io(&path, e))?;
            w.flush().map_err(|e| FsError::from_io(&path, e))?;
            drop(w);
            let info = self.physical.stat(&path).map_err(|e| FsError::from_io(&path, e))?;

            let (_, name) = split_parent(&path);
            let rec = FileRecord::pending(name, size, info.mod_time, owner_email);
            tx.put(path.clone(), rec.encode()?);
            Ok(rec)
        })?;
        info!(target: "docmirror::storage", "upload accepted: path='{}' size={} owner={}", path, rec.size, rec.owner_email);

        if let Some(queue) = &self.notifications {
            queue.dispatch(ConfirmationRequest {
                to: rec.owner_email.clone(),
                path: path.clone(),
                filename: rec.name.clone(),
                token: rec.token.clone(),
            });
        }
        Ok(rec)
    }

    /// Replace the record of an existing file (administrative path). The record's name is
    /// kept in sync with the path.
    pub fn update_meta(&self, directory: &str, filename: &str, mut record: FileRecord) -> FsResult<()> {
        let path = join_logical(directory, filename)?;
        self.meta.update(|tx| -> FsResult<()> {
            match tree::stat(tx, &path)? {
                PathStat::File(_) => {}
                _ => return Err(FsError::NotFound(path.clone())),
            }
            let (_, name) = split_parent(&path);
            record.name = name.to_string();
            tx.put(path.clone(), record.encode()?);
            Ok(())
        })?;
        debug!(target: "docmirror::storage", "update_meta: path='{}'", path);
        Ok(())
    }

    /// Authorize every pending record carrying `token`. Unknown or malformed tokens are
    /// `InvalidToken`; a token whose records are all authorized already confirms zero.
    pub fn confirm(&self, token: &str) -> FsResult<Confirmation> {
        if !is_valid_token(token) {
            return Err(FsError::InvalidToken(token.to_string()));
        }
        let conf = self.meta.update(|tx| -> FsResult<Confirmation> {
            let mut matched = 0usize;
            let mut email: Option<String> = None;
            let mut to_confirm: Vec<(String, FileRecord)> = Vec::new();
            for (key, value) in tx.seek("") {
                let rec = FileRecord::decode(value)?;
                if rec.token != token { continue; }
                matched += 1;
                if email.is_none() { email = Some(rec.owner_email.clone()); }
                if rec.is_pending() { to_confirm.push((key.to_string(), rec)); }
            }
            if matched == 0 {
                return Err(FsError::InvalidToken(token.to_string()));
            }
            let confirmed = to_confirm.len();
            for (key, mut rec) in to_confirm {
                rec.confirm();
                tx.put(key, rec.encode()?);
            }
            Ok(Confirmation { confirmed, email })
        })?;
        if conf.confirmed > 0 {
            info!(target: "docmirror::storage", "{} confirmed {} files with token {}", conf.email.as_deref().unwrap_or("-"), conf.confirmed, token);
        }
        Ok(conf)
    }

    /// Make an empty directory visible by planting a placeholder record inside it. A
    /// directory that already has entries is left untouched.
    pub fn make_dir(&self, path: &str) -> FsResult<()> {
        let dir = clean_logical_path(path)?;
        if dir.is_empty() { return Ok(()); }
        self.meta.update(|tx| -> FsResult<()> {
            match tree::stat(tx, &dir)? {
                PathStat::Directory => return Ok(()),
                PathStat::File(_) => return Err(FsError::AlreadyExists(dir.clone())),
                PathStat::Missing => {}
            }
            ensure_no_file_ancestor(tx, &dir)?;
            tx.put(format!("{}/{}", dir, DIR_PLACEHOLDER), FileRecord::placeholder().encode()?);
            Ok(())
        })?;
        debug!(target: "docmirror::storage", "make_dir: '{}'", dir);
        Ok(())
    }

    /// Insert a record for content already present in the physical store. Returns false if
    /// the path already has a record.
    pub fn import(&self, path: &str, record: FileRecord) -> FsResult<bool> {
        validate_logical_path(path)?;
        self.meta.update(|tx| -> FsResult<bool> {
            match ensure_vacant(tx, path) {
                Ok(()) => {}
                Err(FsError::AlreadyExists(_)) if tx.get(path).is_some() => return Ok(false),
                Err(e) => return Err(e),
            }
            tx.put(path.to_string(), record.encode()?);
            Ok(true)
        })
    }

    /// Every `(path, record)` pair, from one snapshot, in key order.
    pub fn records(&self) -> FsResult<Vec<(String, FileRecord)>> {
        self.meta.view(|snap| {
            snap.seek("")
                .map(|(k, v)| -> FsResult<(String, FileRecord)> { Ok((k.to_string(), FileRecord::decode(v)?)) })
                .collect()
        })
    }

    /// Uploads still waiting for confirmation.
    pub fn pending(&self) -> FsResult<Vec<(String, FileRecord)>> {
        Ok(self.records()?.into_iter().filter(|(_, r)| r.is_pending()).collect())
    }

    pub fn checkpoint(&self) -> FsResult<()> {
        Ok(self.meta.checkpoint()?)
    }
}

/// Fail with `AlreadyExists` unless `path` is free to hold a new file: no record at the
/// path, no directory at the path, and no file at any ancestor.
fn ensure_vacant(tx: &WriteTxn, path: &str) -> FsResult<()> {
    match tree::stat(tx, path)? {
        PathStat::File(_) => return Err(FsError::AlreadyExists(path.to_string())),
        PathStat::Directory => return Err(FsError::AlreadyExists(format!("{} is a directory", path))),
        PathStat::Missing => {}
    }
    ensure_no_file_ancestor(tx, path)
}

fn ensure_no_file_ancestor(tx: &WriteTxn, path: &str) -> FsResult<()> {
    for anc in ancestors(path) {
        if tx.get(anc).is_some() {
            return Err(FsError::AlreadyExists(format!("{} is a file", anc)));
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "file_storage_tests.rs"]
mod file_storage_tests;
