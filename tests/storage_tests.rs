//! Storage facade integration tests: directory emulation, upload/confirm lifecycle,
//! concurrent creates and crash recovery over a real directory.

use std::io::Cursor;
use std::sync::{Arc, Barrier};

use anyhow::Result;
use tempfile::tempdir;

use docmirror::storage::{FileStorage, FsError, MetaSettings, PathStat};

fn upload(fs: &FileStorage, dir: &str, name: &str, body: &[u8]) -> Result<String, FsError> {
    fs.create(dir, name, "student@unitn.it", &mut Cursor::new(body.to_vec())).map(|r| r.token)
}

#[test]
fn directory_tree_is_derived_from_keys() -> Result<()> {
    let fs = FileStorage::in_memory();
    for (dir, name) in [("a", "x.txt"), ("a", "y.txt"), ("b", "z.txt")] {
        let token = upload(&fs, dir, name, b"content")?;
        fs.confirm(&token)?;
    }

    let root = fs.list("")?;
    assert_eq!(root.dirs, vec!["a", "b"]);
    assert!(root.files.is_empty());

    assert!(fs.stat("a")?.is_dir());
    assert!(fs.stat("c").unwrap_err().is_not_found());
    assert!(fs.stat("a/x").unwrap_err().is_not_found());
    let names: Vec<String> = fs.list_public("a")?.files.into_iter().map(|f| f.name).collect();
    assert_eq!(names, vec!["x.txt", "y.txt"]);
    Ok(())
}

#[test]
fn upload_confirm_lifecycle() -> Result<()> {
    let tmp = tempdir()?;
    let fs = FileStorage::open(tmp.path().join("files"), tmp.path().join("meta"), MetaSettings::default())?;

    let token = upload(&fs, "courses/2016", "exam.pdf", b"%PDF-1.4")?;
    match fs.stat("courses/2016/exam.pdf")? {
        PathStat::File(rec) => {
            assert!(!rec.authorized);
            assert_eq!(rec.token, token);
            assert_eq!(rec.size, 8);
        }
        other => panic!("unexpected stat: {:?}", other),
    }
    assert!(fs.list_public("courses/2016")?.files.is_empty());

    assert!(upload(&fs, "courses/2016", "exam.pdf", b"other").unwrap_err().is_already_exists());

    assert_eq!(fs.confirm(&token)?.confirmed, 1);
    assert_eq!(fs.confirm(&token)?.confirmed, 0);
    assert_eq!(fs.list_public("courses/2016")?.files.len(), 1);
    Ok(())
}

#[test]
fn concurrent_creates_of_one_path_have_one_winner() -> Result<()> {
    let tmp = tempdir()?;
    let base = tmp.path().join("files");
    let fs = FileStorage::open(&base, tmp.path().join("meta"), MetaSettings::default())?;
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));

    let results: Vec<Result<String, FsError>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|i| {
                let fs = fs.clone();
                let barrier = barrier.clone();
                s.spawn(move || {
                    barrier.wait();
                    upload(&fs, "race", "same.txt", format!("writer-{}", i).as_bytes())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let winners: Vec<&String> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    for r in &results {
        if let Err(e) = r {
            assert!(e.is_already_exists(), "unexpected error: {:?}", e);
        }
    }

    // content on disk belongs to the winner
    let rec = match fs.stat("race/same.txt")? {
        PathStat::File(rec) => rec,
        other => panic!("unexpected stat: {:?}", other),
    };
    assert_eq!(&rec.token, winners[0]);
    let on_disk = std::fs::read(base.join("race").join("same.txt"))?;
    assert_eq!(on_disk.len() as u64, rec.size);
    assert!(String::from_utf8(on_disk)?.starts_with("writer-"));
    Ok(())
}

#[test]
fn concurrent_creates_of_distinct_paths_all_succeed() -> Result<()> {
    let fs = FileStorage::in_memory();
    std::thread::scope(|s| {
        for i in 0..8 {
            let fs = fs.clone();
            s.spawn(move || {
                for j in 0..10 {
                    upload(&fs, &format!("t{}", i), &format!("f{}.txt", j), b"x").unwrap();
                }
            });
        }
    });
    assert_eq!(fs.records()?.len(), 80);
    assert_eq!(fs.list("")?.dirs.len(), 8);
    Ok(())
}

#[test]
fn reopen_after_torn_log_keeps_committed_uploads() -> Result<()> {
    let tmp = tempdir()?;
    let base = tmp.path().join("files");
    let meta = tmp.path().join("meta");
    let first = {
        let fs = FileStorage::open(&base, &meta, MetaSettings::default())?;
        let first = upload(&fs, "d", "one.txt", b"1")?;
        upload(&fs, "d", "two.txt", b"2")?;
        first
    };

    let wal = meta.join("wal.lg");
    let len = std::fs::metadata(&wal)?.len();
    let f = std::fs::OpenOptions::new().write(true).open(&wal)?;
    f.set_len(len - 3)?;
    drop(f);

    let fs = FileStorage::open(&base, &meta, MetaSettings::default())?;
    assert!(matches!(fs.stat("d/one.txt")?, PathStat::File(_)));
    assert!(fs.stat("d/two.txt").unwrap_err().is_not_found());
    assert_eq!(fs.confirm(&first)?.confirmed, 1);

    // the cut upload can be retried once its leftover content is overwritten
    upload(&fs, "d", "two.txt", b"2 again")?;
    drop(fs);
    let fs = FileStorage::open(&base, &meta, MetaSettings::default())?;
    assert_eq!(fs.records()?.len(), 2);
    Ok(())
}

#[test]
fn checkpoint_compacts_and_preserves_state() -> Result<()> {
    let tmp = tempdir()?;
    let meta = tmp.path().join("meta");
    {
        let fs = FileStorage::open(tmp.path().join("files"), &meta, MetaSettings::default())?;
        for i in 0..5 {
            upload(&fs, "d", &format!("{}.txt", i), b"x")?;
        }
        fs.make_dir("empty")?;
        fs.checkpoint()?;
    }
    assert_eq!(std::fs::metadata(meta.join("wal.lg"))?.len(), 0);
    let fs = FileStorage::open(tmp.path().join("files"), &meta, MetaSettings::default())?;
    assert_eq!(fs.pending()?.len(), 5);
    assert!(fs.stat("empty")?.is_dir());
    Ok(())
}
