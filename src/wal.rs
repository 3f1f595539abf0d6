//! Write-ahead log for ledger mutations
//!
//! Every committed block is appended here before it is considered durable.
//! Records are length-prefixed bincode frames carrying a strictly increasing,
//! gapless sequence number and a checksum over the record content. The writer
//! is a single serialization point: all appends go through one mutex so the
//! sequence and on-disk order always agree.

use crate::block::{Block, Hash};
use crate::error::{ChainError, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

/// Closed set of operations the log can carry.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum WalOp {
    AppendBlock(Block),
    Checkpoint { height: u64, state_root: Hash },
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct WalRecord {
    pub seq: u64,
    pub op: WalOp,
    pub checksum: u32,
}

impl WalRecord {
    pub fn new(seq: u64, op: WalOp) -> Result<Self> {
        Ok(WalRecord {
            seq,
            checksum: checksum_of(seq, &op)?,
            op,
        })
    }
}

fn checksum_of(seq: u64, op: &WalOp) -> Result<u32> {
    let op_bytes = bincode::serialize(op)?;
    let mut hasher = Sha256::new();
    hasher.update(seq.to_le_bytes());
    hasher.update(&op_bytes);
    let digest = hasher.finalize();
    Ok(u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]))
}

struct WalInner {
    file: File,
    last_seq: u64,
    /// Cleared on the first write failure; further appends are refused until
    /// the log is reopened so a half-written tail cannot grow.
    healthy: bool,
}

pub struct WalWriter {
    path: PathBuf,
    inner: Mutex<WalInner>,
}

impl WalWriter {
    /// Opens (or creates) the log at `path`. An incomplete trailing frame
    /// left by a crash is trimmed off; corruption anywhere before the tail
    /// is refused.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let buf = match fs::read(&path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let (records, good_len, truncated) = decode_all(&buf)?;
        let last_seq = records.last().map_or(0, |r| r.seq);

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        if truncated {
            warn!(
                "WAL tail incomplete at offset {}; trimming partial record",
                good_len
            );
            file.set_len(good_len as u64)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::End(0))?;

        Ok(WalWriter {
            path,
            inner: Mutex::new(WalInner {
                file,
                last_seq,
                healthy: true,
            }),
        })
    }

    /// Appends an operation, assigning the next sequence number. Returns only
    /// after the record is flushed to disk.
    pub fn append(&self, op: WalOp) -> Result<u64> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| ChainError::IoError("WAL mutex poisoned".to_string()))?;

        if !inner.healthy {
            return Err(ChainError::WalUnhealthy);
        }

        let seq = inner.last_seq + 1;
        let record = WalRecord::new(seq, op)?;
        let frame = bincode::serialize(&record)?;

        let write = (|| -> Result<()> {
            inner.file.write_all(&(frame.len() as u32).to_le_bytes())?;
            inner.file.write_all(&frame)?;
            inner.file.sync_all()?;
            Ok(())
        })();

        if let Err(e) = write {
            // Fail closed: the tail may be torn, so no further appends.
            inner.healthy = false;
            return Err(e);
        }

        inner.last_seq = seq;
        Ok(seq)
    }

    pub fn last_seq(&self) -> u64 {
        self.inner.lock().map(|i| i.last_seq).unwrap_or(0)
    }

    pub fn is_healthy(&self) -> bool {
        self.inner.lock().map(|i| i.healthy).unwrap_or(false)
    }

    /// Reads back every record with `seq >= from_seq`, validating checksums
    /// and sequence continuity. A partial trailing frame is discarded with a
    /// warning; anything else inconsistent aborts with `Corruption`.
    pub fn replay(&self, from_seq: u64) -> Result<Vec<WalRecord>> {
        let _guard = self
            .inner
            .lock()
            .map_err(|_| ChainError::IoError("WAL mutex poisoned".to_string()))?;

        let buf = fs::read(&self.path)?;
        let (records, _good_len, truncated) = decode_all(&buf)?;
        if truncated {
            warn!("WAL replay: discarding incomplete trailing record");
        }
        Ok(records
            .into_iter()
            .filter(|r| r.seq >= from_seq)
            .collect())
    }

    /// Replaces the log contents wholesale. Used by fork recovery to make the
    /// log reflect a rebuilt canonical chain. A clean rewrite also lifts the
    /// unhealthy refusal, since the log no longer holds the torn tail.
    pub fn rewrite(&self, records: &[WalRecord]) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| ChainError::IoError("WAL mutex poisoned".to_string()))?;

        let write = (|| -> Result<()> {
            inner.file.set_len(0)?;
            inner.file.seek(SeekFrom::Start(0))?;
            for record in records {
                let frame = bincode::serialize(record)?;
                inner.file.write_all(&(frame.len() as u32).to_le_bytes())?;
                inner.file.write_all(&frame)?;
            }
            inner.file.sync_all()?;
            Ok(())
        })();

        if let Err(e) = write {
            // Fail closed: the log may now hold a partial prefix of the new
            // records, so no appends until a reopen or a clean rewrite.
            inner.healthy = false;
            return Err(e);
        }

        inner.last_seq = records.last().map_or(0, |r| r.seq);
        inner.healthy = true;
        info!("WAL rewritten with {} records", records.len());
        Ok(())
    }

    #[cfg(test)]
    fn mark_unhealthy(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.healthy = false;
        }
    }
}

/// Walks the raw log buffer frame by frame. Returns the records read, the
/// byte length of the validated region, and whether a partial frame trails.
fn decode_all(buf: &[u8]) -> Result<(Vec<WalRecord>, usize, bool)> {
    let mut records: Vec<WalRecord> = Vec::new();
    let mut off = 0usize;
    let mut last_good = 0u64;

    loop {
        if off == buf.len() {
            return Ok((records, off, false));
        }
        if buf.len() - off < 4 {
            return Ok((records, off, true));
        }
        let len = u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]) as usize;
        if buf.len() - off - 4 < len {
            return Ok((records, off, true));
        }

        let frame = &buf[off + 4..off + 4 + len];
        let record: WalRecord = bincode::deserialize(frame).map_err(|e| ChainError::Corruption {
            last_good_seq: last_good,
            detail: format!("undecodable record: {}", e),
        })?;

        let expected = checksum_of(record.seq, &record.op)?;
        if expected != record.checksum {
            return Err(ChainError::Corruption {
                last_good_seq: last_good,
                detail: format!("checksum mismatch at seq {}", record.seq),
            });
        }
        if let Some(prev) = records.last() {
            if record.seq != prev.seq + 1 {
                return Err(ChainError::Corruption {
                    last_good_seq: last_good,
                    detail: format!("sequence gap: {} follows {}", record.seq, prev.seq),
                });
            }
        }

        last_good = record.seq;
        records.push(record);
        off += 4 + len;
    }
}
