//! Bulk import of content already sitting in the physical store.

use tracing::{debug, info, warn};

use crate::storage::{normalize_nfc, validate_logical_path, FileRecord, FileStorage, FsError, FsResult};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IndexReport {
    pub indexed: usize,
    /// Already had a record.
    pub existing: usize,
    /// Unusable names or conflicting paths.
    pub rejected: usize,
}

/// Walk every regular file of the physical store and insert an authorized record, owned by
/// `email`, for each one that has none yet.
pub fn index_tree(storage: &FileStorage, email: &str) -> FsResult<IndexReport> {
    index_tree_excluding(storage, email, &[])
}

/// Like `index_tree`, skipping everything below the logical directories in `skip` (for
/// instance the metadata directory when it lives inside the base directory).
pub fn index_tree_excluding(storage: &FileStorage, email: &str, skip: &[String]) -> FsResult<IndexReport> {
    let files = storage.physical().list_files().map_err(|e| FsError::from_io("", e))?;
    let mut report = IndexReport::default();
    for info in files {
        // Keys are NFC, like every path callers hand in
        let key = normalize_nfc(&info.path);
        if skip.iter().any(|d| key.strip_prefix(d.as_str()).is_some_and(|rest| rest.starts_with('/'))) {
            continue;
        }
        if let Err(e) = validate_logical_path(&key) {
            warn!(target: "docmirror::storage", "index: skipping '{}': {}", info.path, e);
            report.rejected += 1;
            continue;
        }
        if key != info.path {
            if storage.physical().stat(&key).is_ok() {
                warn!(target: "docmirror::storage", "index: skipping '{}': normalized name '{}' is taken", info.path, key);
                report.rejected += 1;
                continue;
            }
            storage.physical().rename(&info.path, &key).map_err(|e| FsError::from_io(&info.path, e))?;
            debug!(target: "docmirror::storage", "index: renamed '{}' to its NFC form", info.path);
        }
        let name = key.rsplit('/').next().unwrap_or(key.as_str());
        let rec = FileRecord::imported(name, info.size, info.mod_time, email);
        match storage.import(&key, rec) {
            Ok(true) => {
                debug!(target: "docmirror::storage", "index: added '{}' ({} bytes)", key, info.size);
                report.indexed += 1;
            }
            Ok(false) => report.existing += 1,
            Err(FsError::AlreadyExists(why)) => {
                warn!(target: "docmirror::storage", "index: skipping '{}': {}", key, why);
                report.rejected += 1;
            }
            Err(e) => return Err(e),
        }
    }
    info!(target: "docmirror::storage", "index complete: indexed={} existing={} rejected={}", report.indexed, report.existing, report.rejected);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MetaSettings, PathStat};
    use std::io::{Cursor, Read, Write};

    #[test]
    fn indexes_local_tree_once() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("files");
        std::fs::create_dir_all(base.join("a/b")).unwrap();
        std::fs::write(base.join("a/b/one.pdf"), b"12345").unwrap();
        std::fs::write(base.join("top.txt"), b"x").unwrap();

        let fs = FileStorage::open(&base, tmp.path().join("meta"), MetaSettings::default()).unwrap();
        let report = index_tree(&fs, "admin@unitn.it").unwrap();
        assert_eq!(report, IndexReport { indexed: 2, existing: 0, rejected: 0 });

        match fs.stat_public("a/b/one.pdf").unwrap() {
            PathStat::File(r) => {
                assert_eq!(r.size, 5);
                assert_eq!(r.owner_email, "admin@unitn.it");
                assert!(r.authorized);
            }
            other => panic!("unexpected stat: {:?}", other),
        }

        let again = index_tree(&fs, "admin@unitn.it").unwrap();
        assert_eq!(again, IndexReport { indexed: 0, existing: 2, rejected: 0 });
    }

    #[test]
    fn excluded_directories_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("meta")).unwrap();
        std::fs::write(tmp.path().join("doc.txt"), b"x").unwrap();
        let fs = FileStorage::open(tmp.path(), tmp.path().join("meta"), MetaSettings::default()).unwrap();
        fs.checkpoint().unwrap();
        let report = index_tree_excluding(&fs, "admin@unitn.it", &["meta".to_string()]).unwrap();
        assert_eq!(report.indexed, 1);
        assert!(fs.stat("meta").unwrap_err().is_not_found());
    }

    #[test]
    fn pending_uploads_are_not_authorized_by_indexing() {
        let fs = FileStorage::in_memory();
        let rec = fs.create("d", "up.txt", "s@unitn.it", &mut Cursor::new(b"abc".to_vec())).unwrap();
        let report = index_tree(&fs, "admin@unitn.it").unwrap();
        assert_eq!(report.existing, 1);
        assert!(fs.stat_public("d/up.txt").unwrap_err().is_not_found());
        assert_eq!(fs.confirm(&rec.token).unwrap().confirmed, 1);
    }

    const NFD: &str = "Cafe\u{301}.txt";
    const NFC: &str = "Caf\u{e9}.txt";

    #[test]
    fn decomposed_names_are_indexed_under_nfc() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("files");
        std::fs::create_dir_all(base.join("menu")).unwrap();
        std::fs::write(base.join("menu").join(NFD), b"espresso").unwrap();

        let fs = FileStorage::open(&base, tmp.path().join("meta"), MetaSettings::default()).unwrap();
        let report = index_tree(&fs, "admin@unitn.it").unwrap();
        assert_eq!(report.indexed, 1);

        let keys: Vec<String> = fs.records().unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![format!("menu/{}", NFC)]);
        // either spelling reaches the record and its content
        for name in [NFC, NFD] {
            assert!(matches!(fs.stat_public(&format!("menu/{}", name)).unwrap(), PathStat::File(_)));
        }
        let (rec, mut r) = fs.open_public(&format!("menu/{}", NFD)).unwrap();
        assert_eq!(rec.name, NFC);
        let mut body = String::new();
        r.read_to_string(&mut body).unwrap();
        assert_eq!(body, "espresso");
    }

    #[test]
    fn decomposed_name_colliding_with_composed_one_is_rejected() {
        let fs = FileStorage::in_memory();
        for (name, body) in [(NFC, b"composed".as_slice()), (NFD, b"decomposed".as_slice())] {
            let mut w = fs.physical().create(name).unwrap();
            w.write_all(body).unwrap();
            w.flush().unwrap();
        }
        let report = index_tree(&fs, "admin@unitn.it").unwrap();
        assert_eq!(report, IndexReport { indexed: 1, existing: 0, rejected: 1 });
        let (_, mut r) = fs.open_public(NFC).unwrap();
        let mut body = String::new();
        r.read_to_string(&mut body).unwrap();
        assert_eq!(body, "composed");
    }
}
