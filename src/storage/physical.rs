//! Physical content storage addressed by logical path.
//!
//! The contract is small: open for reading, create (truncate, with intermediate
//! directories), stat, rename, and enumerate. No locking happens here; the
//! `FileStorage` facade serializes writers.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

/// Physical attributes of stored content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalInfo {
    /// Logical path (`/`-separated, relative to the store root).
    pub path: String,
    pub size: u64,
    pub mod_time: DateTime<Utc>,
}

pub trait PhysicalStore: Send + Sync {
    /// Open existing content for reading.
    fn open(&self, path: &str) -> io::Result<Box<dyn Read + Send>>;
    /// Create (or truncate) content, creating intermediate directories. Content is durable
    /// once the returned writer has been flushed.
    fn create(&self, path: &str) -> io::Result<Box<dyn Write + Send>>;
    fn stat(&self, path: &str) -> io::Result<PhysicalInfo>;
    /// Move content to a new path, creating intermediate directories.
    fn rename(&self, from: &str, to: &str) -> io::Result<()>;
    /// Enumerate every stored file.
    fn list_files(&self) -> io::Result<Vec<PhysicalInfo>>;
}

/// Native filesystem store restricted to a base directory. Logical paths are cleaned as if
/// rooted at `/`, so `..` can never climb above the base.
#[derive(Debug, Clone)]
pub struct LocalDir {
    base: PathBuf,
}

impl LocalDir {
    pub fn new(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        let base = if base.as_os_str().is_empty() { PathBuf::from(".") } else { base.to_path_buf() };
        Self { base }
    }

    pub fn base(&self) -> &Path { &self.base }

    fn resolve(&self, name: &str) -> io::Result<PathBuf> {
        if name.contains('\u{0000}') || name.contains('\\') {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid character in file path"));
        }
        let mut segs: Vec<&str> = Vec::new();
        for seg in name.split('/') {
            match seg {
                "" | "." => {}
                ".." => { segs.pop(); }
                s => segs.push(s),
            }
        }
        let mut p = self.base.clone();
        for s in segs { p.push(s); }
        Ok(p)
    }

    fn logical_of(&self, p: &Path) -> Option<String> {
        let rel = p.strip_prefix(&self.base).ok()?;
        let parts: Vec<String> = rel.components().map(|c| c.as_os_str().to_string_lossy().to_string()).collect();
        Some(parts.join("/"))
    }
}

/// File handle that syncs data to disk on flush.
struct SyncOnFlush(File);

impl Write for SyncOnFlush {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> { self.0.write(buf) }
    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()?;
        self.0.sync_data()
    }
}

fn info_from_metadata(path: String, md: &std::fs::Metadata) -> PhysicalInfo {
    let mod_time = md.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now());
    PhysicalInfo { path, size: md.len(), mod_time }
}

impl PhysicalStore for LocalDir {
    fn open(&self, path: &str) -> io::Result<Box<dyn Read + Send>> {
        let p = self.resolve(path)?;
        Ok(Box::new(File::open(p)?))
    }

    fn create(&self, path: &str) -> io::Result<Box<dyn Write + Send>> {
        let p = self.resolve(path)?;
        if let Some(parent) = p.parent() {
            std::fs::create_dir_all(parent)?;
        }
        debug!(target: "docmirror::storage", "physical create: '{}'", p.display());
        let f = OpenOptions::new().create(true).write(true).truncate(true).open(&p)?;
        Ok(Box::new(SyncOnFlush(f)))
    }

    fn stat(&self, path: &str) -> io::Result<PhysicalInfo> {
        let p = self.resolve(path)?;
        let md = std::fs::metadata(&p)?;
        if md.is_dir() {
            return Err(io::Error::new(io::ErrorKind::NotFound, format!("'{}' is a directory", path)));
        }
        Ok(info_from_metadata(path.to_string(), &md))
    }

    fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        debug!(target: "docmirror::storage", "physical rename: '{}' -> '{}'", src.display(), dst.display());
        std::fs::rename(src, dst)
    }

    fn list_files(&self) -> io::Result<Vec<PhysicalInfo>> {
        let mut out = Vec::new();
        if !self.base.exists() { return Ok(out); }
        for entry in walkdir::WalkDir::new(&self.base).sort_by_file_name() {
            let entry = entry.map_err(|e| io::Error::other(e.to_string()))?;
            if !entry.file_type().is_file() { continue; }
            let Some(logical) = self.logical_of(entry.path()) else { continue; };
            let md = entry.metadata().map_err(|e| io::Error::other(e.to_string()))?;
            out.push(info_from_metadata(logical, &md));
        }
        Ok(out)
    }
}

#[derive(Clone)]
struct MemEntry {
    bytes: Vec<u8>,
    mod_time: DateTime<Utc>,
}

/// In-process content store for tests and ephemeral deployments.
#[derive(Clone, Default)]
pub struct MemoryStore {
    files: Arc<RwLock<BTreeMap<String, MemEntry>>>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.files.read().len() }
    pub fn is_empty(&self) -> bool { self.files.read().is_empty() }
}

/// Buffers content and publishes it to the map on flush (and again on drop).
struct MemoryWriter {
    path: String,
    buf: Vec<u8>,
    files: Arc<RwLock<BTreeMap<String, MemEntry>>>,
}

impl MemoryWriter {
    fn publish(&self) {
        self.files.write().insert(self.path.clone(), MemEntry { bytes: self.buf.clone(), mod_time: Utc::now() });
    }
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        self.publish();
        Ok(())
    }
}

impl Drop for MemoryWriter {
    fn drop(&mut self) { self.publish(); }
}

fn clean_mem_path(path: &str) -> String {
    path.split('/').filter(|s| !s.is_empty() && *s != ".").collect::<Vec<_>>().join("/")
}

impl PhysicalStore for MemoryStore {
    fn open(&self, path: &str) -> io::Result<Box<dyn Read + Send>> {
        let key = clean_mem_path(path);
        let r = self.files.read();
        let ent = r.get(&key).ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, key.clone()))?;
        Ok(Box::new(Cursor::new(ent.bytes.clone())))
    }

    fn create(&self, path: &str) -> io::Result<Box<dyn Write + Send>> {
        let key = clean_mem_path(path);
        if key.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty path"));
        }
        let w = MemoryWriter { path: key, buf: Vec::new(), files: self.files.clone() };
        w.publish();
        Ok(Box::new(w))
    }

    fn stat(&self, path: &str) -> io::Result<PhysicalInfo> {
        let key = clean_mem_path(path);
        let r = self.files.read();
        let ent = r.get(&key).ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, key.clone()))?;
        Ok(PhysicalInfo { path: key, size: ent.bytes.len() as u64, mod_time: ent.mod_time })
    }

    fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        let (from, to) = (clean_mem_path(from), clean_mem_path(to));
        let mut w = self.files.write();
        let ent = w.remove(&from).ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, from.clone()))?;
        w.insert(to, ent);
        Ok(())
    }

    fn list_files(&self) -> io::Result<Vec<PhysicalInfo>> {
        Ok(self.files.read().iter()
            .map(|(k, e)| PhysicalInfo { path: k.clone(), size: e.bytes.len() as u64, mod_time: e.mod_time })
            .collect())
    }
}
