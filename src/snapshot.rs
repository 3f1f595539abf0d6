//! Snapshot management
//!
//! Snapshots bound WAL replay on restart: a full materialization of chain
//! state is written every `snapshot_interval` commits, and recovery replays
//! only the WAL records after the snapshot's watermark. Files are written to
//! a temp path and renamed so a crash can never leave a half-written file
//! that passes for valid; startup falls back to the next older snapshot when
//! the newest one does not decode.

use crate::block::{Block, Hash};
use crate::error::{ChainError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

const SNAPSHOT_EXT: &str = "snap";
/// How many completed snapshots to retain; older ones are pruned.
const SNAPSHOTS_KEPT: usize = 2;

/// Fully-materialized chain state at a given height.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Snapshot {
    pub height: u64,
    pub tip_hash: Hash,
    pub state_root: Hash,
    pub blocks: Vec<Block>,
    pub wal_seq_at_snapshot: u64,
}

pub struct SnapshotManager {
    dir: PathBuf,
    interval: u64,
    commits_since: Mutex<u64>,
}

impl SnapshotManager {
    pub fn new<P: AsRef<Path>>(dir: P, interval: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(SnapshotManager {
            dir,
            interval,
            commits_since: Mutex::new(0),
        })
    }

    /// Counts one committed block; returns true when a snapshot is due. The
    /// counter resets only when `write` succeeds, so a failed snapshot is
    /// retried on the next commit.
    pub fn note_commit(&self) -> bool {
        let mut count = match self.commits_since.lock() {
            Ok(guard) => guard,
            Err(_) => return false,
        };
        *count += 1;
        self.interval > 0 && *count >= self.interval
    }

    /// Writes the snapshot atomically: temp file, fsync, rename.
    pub fn write(&self, snapshot: &Snapshot) -> Result<PathBuf> {
        let final_path = self.path_for(snapshot.height);
        let tmp_path = final_path.with_extension(format!("{}.tmp", SNAPSHOT_EXT));

        let encoded = bincode::serialize(snapshot)?;
        fs::write(&tmp_path, &encoded)?;
        let tmp = fs::File::open(&tmp_path)?;
        tmp.sync_all()?;
        drop(tmp);
        fs::rename(&tmp_path, &final_path)?;

        if let Ok(mut count) = self.commits_since.lock() {
            *count = 0;
        }
        info!(
            "Snapshot written at height {} (wal seq {})",
            snapshot.height, snapshot.wal_seq_at_snapshot
        );

        self.prune_old();
        Ok(final_path)
    }

    /// Loads the newest snapshot that decodes cleanly. Stray temp files and
    /// undecodable candidates are discarded with a warning; an empty
    /// directory is a cold start, not an error.
    pub fn load_latest(&self) -> Result<Option<Snapshot>> {
        let mut candidates = self.list_snapshots()?;
        candidates.sort_by(|a, b| b.0.cmp(&a.0));

        // Leftover temp files are incomplete writes by definition.
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
                warn!("Discarding partial snapshot {:?}", path);
                let _ = fs::remove_file(&path);
            }
        }

        for (height, path) in candidates {
            match fs::read(&path)
                .map_err(ChainError::from)
                .and_then(|buf| bincode::deserialize::<Snapshot>(&buf).map_err(ChainError::from))
            {
                Ok(snapshot) if snapshot.height == height => {
                    info!("Loaded snapshot at height {}", snapshot.height);
                    return Ok(Some(snapshot));
                }
                Ok(snapshot) => {
                    warn!(
                        "Snapshot {:?} claims height {} but is named for {}; skipping",
                        path, snapshot.height, height
                    );
                }
                Err(e) => {
                    warn!("Snapshot {:?} unreadable ({}); trying older one", path, e);
                }
            }
        }
        Ok(None)
    }

    fn path_for(&self, height: u64) -> PathBuf {
        self.dir
            .join(format!("snapshot-{:012}.{}", height, SNAPSHOT_EXT))
    }

    fn list_snapshots(&self) -> Result<Vec<(u64, PathBuf)>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SNAPSHOT_EXT) {
                continue;
            }
            let stem = match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) => stem,
                None => continue,
            };
            if let Some(height) = stem
                .strip_prefix("snapshot-")
                .and_then(|h| h.parse::<u64>().ok())
            {
                out.push((height, path));
            }
        }
        Ok(out)
    }

    /// Removes every snapshot. Used when the chain is rebuilt and existing
    /// snapshots may describe a displaced branch.
    pub fn purge(&self) -> Result<()> {
        for (height, path) in self.list_snapshots()? {
            fs::remove_file(&path)?;
            info!("Purged snapshot at height {}", height);
        }
        Ok(())
    }

    fn prune_old(&self) {
        let mut snapshots = match self.list_snapshots() {
            Ok(s) => s,
            Err(_) => return,
        };
        snapshots.sort_by(|a, b| b.0.cmp(&a.0));
        for (height, path) in snapshots.into_iter().skip(SNAPSHOTS_KEPT) {
            if fs::remove_file(&path).is_ok() {
                info!("Pruned old snapshot at height {}", height);
            }
        }
    }
}
