//! Metadata WAL (write-ahead log)
//! ------------------------------
//! Append-only log of committed metadata transactions. Every record is framed as
//! `header(12) | payload | crc32(payload)`; a transaction is `Begin`, `Data`, `Commit`
//! and is fsynced on commit. Recovery applies only transactions whose `Commit`
//! record made it to disk; a torn or corrupt tail ends the log.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crc32fast::Hasher as Crc32;

use crate::storage::StoreError;

const MAGIC_WAL: u32 = 0x444D_4C31; // 'DML1'
const HEADER_LEN: u64 = 12;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecKind { Begin = 1, Data = 2, Commit = 3 }

#[derive(Debug, Clone, Copy)]
struct RecHeader { magic: u32, kind: u8, version: u8, _pad: u16, len: u32 }

impl RecHeader {
    fn to_bytes(self) -> [u8; 12] {
        let mut buf = [0u8; 12];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4] = self.kind; buf[5] = self.version; buf[6..8].copy_from_slice(&self._pad.to_le_bytes());
        buf[8..12].copy_from_slice(&self.len.to_le_bytes());
        buf
    }
    fn from_bytes(buf: &[u8; 12]) -> Self {
        Self {
            magic: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            kind: buf[4],
            version: buf[5],
            _pad: u16::from_le_bytes([buf[6], buf[7]]),
            len: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
        }
    }
}

fn write_u64(buf: &mut Vec<u8>, v: u64) { buf.extend_from_slice(&v.to_le_bytes()); }
fn write_u32(buf: &mut Vec<u8>, v: u32) { buf.extend_from_slice(&v.to_le_bytes()); }

/// Bounds-checked little-endian reader over a record payload.
struct PayloadReader<'a> { buf: &'a [u8], off: usize }

impl<'a> PayloadReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], StoreError> {
        let end = self.off.checked_add(n).filter(|e| *e <= self.buf.len())
            .ok_or_else(|| StoreError::CorruptLog("payload truncated".into()))?;
        let s = &self.buf[self.off..end];
        self.off = end;
        Ok(s)
    }
    fn u64(&mut self) -> Result<u64, StoreError> {
        let b = self.take(8)?;
        let mut a = [0u8; 8]; a.copy_from_slice(b);
        Ok(u64::from_le_bytes(a))
    }
    fn u32(&mut self) -> Result<u32, StoreError> {
        let b = self.take(4)?;
        let mut a = [0u8; 4]; a.copy_from_slice(b);
        Ok(u32::from_le_bytes(a))
    }
    fn bytes(&mut self) -> Result<Vec<u8>, StoreError> {
        let n = self.u32()? as usize;
        Ok(self.take(n)?.to_vec())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TxnData { pub txn_id: u64, pub puts: Vec<(String, Vec<u8>)> }

#[derive(Debug, Clone, PartialEq)]
pub enum WalRecord { Begin { txn_id: u64 }, Data(TxnData), Commit { txn_id: u64 } }

/// WAL writer appends whole transactions and fsyncs on commit.
pub struct WalWriter {
    file: File,
    /// Set when a failed append could not be rolled back; the log may end in a torn record.
    broken: Option<String>,
}

impl WalWriter {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() { std::fs::create_dir_all(parent)?; }
        let file = OpenOptions::new().create(true).append(true).read(true).open(path)?;
        Ok(Self { file, broken: None })
    }

    pub fn len(&self) -> Result<u64, StoreError> { Ok(self.file.metadata()?.len()) }

    pub fn is_broken(&self) -> bool { self.broken.is_some() }

    /// Append Begin/Data/Commit for one transaction. On failure the file is cut back to
    /// its previous length so later appends never land behind a torn record. If that cut
    /// fails too, the writer refuses every further append until `truncate` succeeds:
    /// recovery stops at the first bad record and would drop anything written after it.
    pub fn append_txn(&mut self, txn_id: u64, puts: &BTreeMap<String, Vec<u8>>, sync: bool) -> Result<(), StoreError> {
        if let Some(why) = &self.broken {
            return Err(StoreError::CorruptLog(format!("log writer disabled: {}", why)));
        }
        let start = self.len()?;
        let res = self.append_txn_inner(txn_id, puts, sync);
        if let Err(e) = &res {
            if let Err(cut) = self.file.set_len(start) {
                let why = format!("append of txn {} failed ({}) and rollback to byte {} failed ({})", txn_id, e, start, cut);
                self.broken = Some(why.clone());
                return Err(StoreError::CorruptLog(why));
            }
        }
        res
    }

    fn append_txn_inner(&mut self, txn_id: u64, puts: &BTreeMap<String, Vec<u8>>, sync: bool) -> Result<(), StoreError> {
        let mut begin = Vec::with_capacity(8);
        write_u64(&mut begin, txn_id);
        self.write_record(RecKind::Begin, &begin)?;

        let mut data = Vec::new();
        write_u64(&mut data, txn_id);
        write_u32(&mut data, puts.len() as u32);
        for (k, v) in puts {
            write_u32(&mut data, k.len() as u32); data.extend_from_slice(k.as_bytes());
            write_u32(&mut data, v.len() as u32); data.extend_from_slice(v);
        }
        self.write_record(RecKind::Data, &data)?;

        let mut commit = Vec::with_capacity(8);
        write_u64(&mut commit, txn_id);
        self.write_record(RecKind::Commit, &commit)?;
        if sync {
            self.file.flush()?;
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn write_record(&mut self, kind: RecKind, payload: &[u8]) -> Result<(), StoreError> {
        let mut hasher = Crc32::new(); hasher.update(payload); let crc = hasher.finalize();
        let header = RecHeader { magic: MAGIC_WAL, kind: kind as u8, version: 1, _pad: 0, len: payload.len() as u32 };
        let mut frame = Vec::with_capacity(HEADER_LEN as usize + payload.len() + 4);
        frame.extend_from_slice(&header.to_bytes());
        frame.extend_from_slice(payload);
        frame.extend_from_slice(&crc.to_le_bytes());
        self.file.write_all(&frame)?;
        Ok(())
    }

    /// Drop every record (after a checkpoint captured them in a snapshot).
    pub fn truncate(&mut self) -> Result<(), StoreError> {
        self.file.set_len(0)?;
        self.file.sync_all()?;
        self.broken = None;
        Ok(())
    }

    /// Cut the log to `len` bytes (used by recovery to drop a torn tail).
    pub fn truncate_to(&mut self, len: u64) -> Result<(), StoreError> {
        self.file.set_len(len)?;
        self.file.sync_all()?;
        Ok(())
    }
}

/// Outcome of scanning a log file.
#[derive(Debug, Default)]
pub struct Recovered {
    /// Committed transactions in log order.
    pub committed: Vec<TxnData>,
    /// Byte offset just past the last committed transaction.
    pub valid_len: u64,
    /// True if bytes after `valid_len` were discarded (torn write, corruption, or an
    /// unfinished transaction).
    pub torn: bool,
}

/// WAL reader that validates magic and per-record CRC.
pub struct WalReader { file: File, end: u64 }

impl WalReader {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let mut f = OpenOptions::new().read(true).open(path)?;
        let end = f.seek(SeekFrom::End(0))?; f.seek(SeekFrom::Start(0))?;
        Ok(Self { file: f, end })
    }

    /// Read one framed record; `Ok(None)` means the remaining bytes do not form a valid record.
    fn next_record(&mut self) -> Result<Option<WalRecord>, StoreError> {
        let pos = self.file.stream_position()?;
        if pos + HEADER_LEN > self.end { return Ok(None); }
        let mut hb = [0u8; 12];
        self.file.read_exact(&mut hb)?;
        let header = RecHeader::from_bytes(&hb);
        if header.magic != MAGIC_WAL { return Ok(None); }
        if pos + HEADER_LEN + header.len as u64 + 4 > self.end { return Ok(None); }
        let mut payload = vec![0u8; header.len as usize];
        self.file.read_exact(&mut payload)?;
        let mut crc_bytes = [0u8; 4]; self.file.read_exact(&mut crc_bytes)?;
        let mut hasher = Crc32::new(); hasher.update(&payload);
        if u32::from_le_bytes(crc_bytes) != hasher.finalize() { return Ok(None); }

        let mut r = PayloadReader { buf: &payload, off: 0 };
        let rec = match header.kind {
            x if x == RecKind::Begin as u8 => WalRecord::Begin { txn_id: r.u64()? },
            x if x == RecKind::Commit as u8 => WalRecord::Commit { txn_id: r.u64()? },
            x if x == RecKind::Data as u8 => {
                let txn_id = r.u64()?;
                let n = r.u32()? as usize;
                let mut puts = Vec::with_capacity(n);
                for _ in 0..n {
                    let k = String::from_utf8(r.bytes()?)
                        .map_err(|_| StoreError::CorruptLog("non UTF-8 key".into()))?;
                    let v = r.bytes()?;
                    puts.push((k, v));
                }
                WalRecord::Data(TxnData { txn_id, puts })
            }
            other => return Err(StoreError::CorruptLog(format!("unknown record kind {}", other))),
        };
        Ok(Some(rec))
    }

    pub fn read_all(&mut self) -> Result<Vec<WalRecord>, StoreError> {
        let mut out = Vec::new();
        while let Some(rec) = self.next_record()? { out.push(rec); }
        Ok(out)
    }

    /// Collect committed transactions, stopping at the first invalid record.
    pub fn recover(&mut self) -> Result<Recovered, StoreError> {
        let mut out = Recovered::default();
        let mut open: Option<(u64, Vec<TxnData>)> = None;
        loop {
            let rec = match self.next_record() {
                Ok(Some(r)) => r,
                Ok(None) => break,
                Err(StoreError::CorruptLog(_)) => break,
                Err(e) => return Err(e),
            };
            match rec {
                WalRecord::Begin { txn_id } => { open = Some((txn_id, Vec::new())); }
                WalRecord::Data(d) => match open.as_mut() {
                    Some((id, datas)) if *id == d.txn_id => datas.push(d),
                    _ => break,
                },
                WalRecord::Commit { txn_id } => match open.take() {
                    Some((id, datas)) if id == txn_id => {
                        let mut puts = Vec::new();
                        for d in datas { puts.extend(d.puts); }
                        out.committed.push(TxnData { txn_id, puts });
                        out.valid_len = self.file.stream_position()?;
                    }
                    _ => break,
                },
            }
        }
        out.torn = out.valid_len < self.end;
        Ok(out)
    }
}

#[cfg(test)]
#[path = "wal_tests.rs"]
mod wal_tests;
