//! Directory semantics over the flat, ordered metadata keyspace.
//!
//! Nothing marks a directory explicitly: `a/b` is a directory exactly when at least one
//! key starts with `a/b/`. Listing relies on every prefix being one contiguous key range,
//! which holds for byte-lexicographic order over full paths.

use super::meta::KvRead;
use super::paths::dir_prefix;
use super::record::FileRecord;
use super::FsResult;

#[derive(Debug, Clone, PartialEq)]
pub enum PathStat {
    Missing,
    File(FileRecord),
    Directory,
}

impl PathStat {
    pub fn is_dir(&self) -> bool { matches!(self, PathStat::Directory) }
}

/// Immediate children of a directory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Listing {
    /// Child directory names, in key order, without duplicates.
    pub dirs: Vec<String>,
    /// Direct file children, in key order.
    pub files: Vec<FileRecord>,
}

impl Listing {
    /// Drop records that must not be served publicly (pending uploads, placeholders).
    pub fn public(self) -> Listing {
        Listing { dirs: self.dirs, files: self.files.into_iter().filter(|f| f.is_public()).collect() }
    }
}

/// Classify a canonical path. The root (`""`) is always a directory.
pub fn stat<R: KvRead + ?Sized>(r: &R, path: &str) -> FsResult<PathStat> {
    if path.is_empty() {
        return Ok(PathStat::Directory);
    }
    if let Some(v) = r.get(path) {
        return Ok(PathStat::File(FileRecord::decode(v)?));
    }
    if has_descendants(r, path) {
        Ok(PathStat::Directory)
    } else {
        Ok(PathStat::Missing)
    }
}

/// True if any key lives below `dir/`.
pub fn has_descendants<R: KvRead + ?Sized>(r: &R, dir: &str) -> bool {
    let prefix = dir_prefix(dir);
    let found = r.scan_prefix(&prefix).next().is_some();
    found
}

/// List the immediate children of a canonical directory path.
pub fn list<R: KvRead + ?Sized>(r: &R, dir: &str) -> FsResult<Listing> {
    let prefix = dir_prefix(dir);
    let mut out = Listing::default();
    let mut last_dir: Option<&str> = None;
    for (key, value) in r.scan_prefix(&prefix) {
        let rest = &key[prefix.len()..];
        if let Some(pos) = rest.find('/') {
            // descendant of a child directory; siblings under it are adjacent
            let child = &rest[..pos];
            if last_dir == Some(child) { continue; }
            last_dir = Some(child);
            out.dirs.push(child.to_string());
            continue;
        }
        out.files.push(FileRecord::decode(value)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::meta::MetaStore;
    use crate::storage::StoreError;
    use chrono::Utc;

    fn seed(paths: &[(&str, bool)]) -> MetaStore {
        let store = MetaStore::in_memory();
        store.update(|tx| -> Result<(), StoreError> {
            for (p, authorized) in paths {
                let name = p.rsplit('/').next().unwrap_or(p);
                let mut rec = FileRecord::pending(name, 1, Utc::now(), "u@unitn.it");
                rec.authorized = *authorized;
                tx.put(*p, serde_json::to_vec(&rec)?);
            }
            Ok(())
        }).unwrap();
        store
    }

    #[test]
    fn root_lists_dirs_without_duplicates() {
        let store = seed(&[("a/x.txt", true), ("a/y.txt", true), ("b/z.txt", true)]);
        let l = list(&store.snapshot(), "").unwrap();
        assert_eq!(l.dirs, vec!["a", "b"]);
        assert!(l.files.is_empty());
    }

    #[test]
    fn nested_listing_mixes_files_and_dirs() {
        let store = seed(&[("a/x.txt", true), ("a/sub/1.txt", true), ("a/sub/deeper/2.txt", true), ("a/y.txt", true), ("ab.txt", true)]);
        let l = list(&store.snapshot(), "a").unwrap();
        assert_eq!(l.dirs, vec!["sub"]);
        let names: Vec<&str> = l.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["x.txt", "y.txt"]);
    }

    #[test]
    fn stat_distinguishes_file_dir_and_missing() {
        let store = seed(&[("a/x.txt", true), ("a-b/q.txt", true), ("ab.txt", true)]);
        let snap = store.snapshot();
        assert!(matches!(stat(&snap, "a/x.txt").unwrap(), PathStat::File(r) if r.name == "x.txt"));
        assert_eq!(stat(&snap, "a").unwrap(), PathStat::Directory);
        assert_eq!(stat(&snap, "").unwrap(), PathStat::Directory);
        // prefix of other keys without a '/' boundary is not a directory
        assert_eq!(stat(&snap, "a-").unwrap(), PathStat::Missing);
        assert_eq!(stat(&snap, "ab").unwrap(), PathStat::Missing);
        assert_eq!(stat(&snap, "a/x").unwrap(), PathStat::Missing);
        assert_eq!(stat(&snap, "nope").unwrap(), PathStat::Missing);
    }

    #[test]
    fn public_listing_hides_pending() {
        let store = seed(&[("d/ok.txt", true), ("d/pending.txt", false)]);
        let l = list(&store.snapshot(), "d").unwrap().public();
        assert_eq!(l.files.len(), 1);
        assert_eq!(l.files[0].name, "ok.txt");
    }

    #[test]
    fn corrupt_record_surfaces_as_error() {
        let store = MetaStore::in_memory();
        store.update(|tx| -> Result<(), StoreError> { tx.put("bad.txt", b"not json".to_vec()); Ok(()) }).unwrap();
        assert!(list(&store.snapshot(), "").is_err());
        assert!(stat(&store.snapshot(), "bad.txt").is_err());
    }
}
