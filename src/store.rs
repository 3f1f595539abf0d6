//! Chain store: the authoritative, recovered view of the canonical chain
//!
//! All canonical mutation funnels through `commit_block`, which holds the
//! state lock across the WAL append and the in-memory update so readers never
//! observe a block that is not yet durable. Startup goes through `recover`,
//! which seeds state from the newest valid snapshot and replays the trailing
//! WAL records.

use crate::block::{Block, Hash, ZERO_HASH};
use crate::config::LedgerConfig;
use crate::error::{ChainError, Result};
use crate::snapshot::{Snapshot, SnapshotManager};
use crate::wal::{WalOp, WalRecord, WalWriter};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    Uninitialized,
    Recovering,
    Ready,
    /// Terminal until an operator runs fork recovery (`rebuild`).
    Corrupted,
}

/// Canonical chain plus the WAL watermark. Owned by the store; external code
/// only sees clones of blocks, never mutable access.
#[derive(Debug, Default)]
pub struct ChainState {
    blocks: Vec<Block>,
    index: HashMap<Hash, u64>,
    last_applied_seq: u64,
}

impl ChainState {
    fn tip(&self) -> Option<&Block> {
        self.blocks.last()
    }

    fn tip_hash(&self) -> Hash {
        self.tip().map_or(ZERO_HASH, |b| b.hash)
    }

    /// Appends a block that must extend the current tip.
    fn append(&mut self, block: Block) -> Result<()> {
        let expected_height = self.blocks.len() as u64;
        if block.height != expected_height {
            return Err(ChainError::InvalidBlock(format!(
                "expected height {}, got {}",
                expected_height, block.height
            )));
        }
        if block.parent_hash != self.tip_hash() {
            return Err(ChainError::InvalidBlock(format!(
                "parent {} does not match tip {}",
                hex::encode(block.parent_hash),
                hex::encode(self.tip_hash())
            )));
        }
        self.index.insert(block.hash, block.height);
        self.blocks.push(block);
        Ok(())
    }

    fn state_root(&self) -> Hash {
        let mut hasher = Sha256::new();
        for block in &self.blocks {
            hasher.update(block.height.to_le_bytes());
            hasher.update(block.hash);
        }
        hasher.finalize().into()
    }
}

pub struct ChainStore {
    wal: WalWriter,
    snapshots: SnapshotManager,
    state: Mutex<ChainState>,
    status: Mutex<StoreStatus>,
}

impl ChainStore {
    /// Opens WAL and snapshot storage. The store is not usable until
    /// `recover` has run.
    pub fn open(cfg: &LedgerConfig) -> Result<Self> {
        let wal = WalWriter::open(&cfg.wal_path)?;
        let snapshots = SnapshotManager::new(&cfg.snapshot_path, cfg.snapshot_interval)?;
        Ok(ChainStore {
            wal,
            snapshots,
            state: Mutex::new(ChainState::default()),
            status: Mutex::new(StoreStatus::Uninitialized),
        })
    }

    pub fn status(&self) -> StoreStatus {
        self.status
            .lock()
            .map(|s| *s)
            .unwrap_or(StoreStatus::Corrupted)
    }

    fn set_status(&self, status: StoreStatus) {
        if let Ok(mut guard) = self.status.lock() {
            *guard = status;
        }
    }

    fn require_ready(&self) -> Result<()> {
        match self.status() {
            StoreStatus::Ready => Ok(()),
            other => Err(ChainError::NotReady(format!("store is {:?}", other))),
        }
    }

    /// Rebuilds canonical state from the latest valid snapshot plus trailing
    /// WAL records. A record that does not extend the recovered tip marks the
    /// store `Corrupted`; only operator fork recovery can clear that.
    pub fn recover(&self) -> Result<()> {
        self.set_status(StoreStatus::Recovering);

        let mut state = ChainState::default();
        if let Some(snapshot) = self.snapshots.load_latest()? {
            for block in snapshot.blocks {
                state.index.insert(block.hash, block.height);
                state.blocks.push(block);
            }
            state.last_applied_seq = snapshot.wal_seq_at_snapshot;
        }

        let records = match self.wal.replay(state.last_applied_seq + 1) {
            Ok(records) => records,
            Err(e) => {
                error!("WAL replay failed: {}", e);
                self.set_status(StoreStatus::Corrupted);
                return Err(e);
            }
        };

        for record in records {
            match record.op {
                WalOp::AppendBlock(block) => {
                    if let Err(e) = state.append(block) {
                        error!(
                            "WAL record {} inconsistent with recovered chain: {}",
                            record.seq, e
                        );
                        self.set_status(StoreStatus::Corrupted);
                        return Err(ChainError::Corruption {
                            last_good_seq: state.last_applied_seq,
                            detail: format!("record {} does not extend the chain", record.seq),
                        });
                    }
                }
                WalOp::Checkpoint { .. } => {}
            }
            state.last_applied_seq = record.seq;
        }

        let height = state.blocks.len();
        let mut guard = self
            .state
            .lock()
            .map_err(|_| ChainError::IoError("state mutex poisoned".to_string()))?;
        *guard = state;
        drop(guard);

        self.set_status(StoreStatus::Ready);
        info!("Chain store recovered: {} blocks", height);
        Ok(())
    }

    /// Appends a committed block: linkage check, durable WAL write, then the
    /// in-memory update, all under one exclusive lock. A WAL failure means
    /// the block was never committed.
    pub fn commit_block(&self, block: Block) -> Result<()> {
        self.require_ready()?;

        let mut state = self
            .state
            .lock()
            .map_err(|_| ChainError::IoError("state mutex poisoned".to_string()))?;

        let expected_height = state.blocks.len() as u64;
        if block.height != expected_height || block.parent_hash != state.tip_hash() {
            return Err(ChainError::InvalidBlock(format!(
                "block {} at height {} does not extend tip {}",
                crate::block::short(&block.hash),
                block.height,
                crate::block::short(&state.tip_hash())
            )));
        }

        let seq = self.wal.append(WalOp::AppendBlock(block.clone()))?;
        // Linkage was checked above under the same lock, so this cannot
        // disagree with the record just written.
        state.append(block)?;
        state.last_applied_seq = seq;

        if self.snapshots.note_commit() {
            let snapshot = Snapshot {
                height: state.tip().map_or(0, |b| b.height),
                tip_hash: state.tip_hash(),
                state_root: state.state_root(),
                blocks: state.blocks.clone(),
                wal_seq_at_snapshot: seq,
            };
            // The block is already WAL-durable; a failed snapshot costs
            // replay time, not data, so it is logged and retried later.
            if let Err(e) = self.snapshots.write(&snapshot) {
                error!("Snapshot write failed: {}", e);
            } else {
                // Checkpoint record marks the snapshot point in the log.
                let checkpoint = WalOp::Checkpoint {
                    height: snapshot.height,
                    state_root: snapshot.state_root,
                };
                match self.wal.append(checkpoint) {
                    Ok(ckpt_seq) => state.last_applied_seq = ckpt_seq,
                    Err(e) => error!("Checkpoint append failed: {}", e),
                }
            }
        }
        Ok(())
    }

    /// Replaces the canonical chain wholesale, re-validating every block and
    /// rewriting the WAL to match. Fork recovery enters here; it also clears
    /// a `Corrupted` status once the new chain applies cleanly.
    pub fn rebuild(&self, blocks: Vec<Block>) -> Result<()> {
        let mut fresh = ChainState::default();
        let mut records = Vec::with_capacity(blocks.len());
        for (i, block) in blocks.into_iter().enumerate() {
            if !block.verify_integrity() {
                return Err(ChainError::PromotionConflict(format!(
                    "block at height {} failed re-validation",
                    block.height
                )));
            }
            records.push(WalRecord::new(i as u64 + 1, WalOp::AppendBlock(block.clone()))?);
            fresh.append(block).map_err(|e| {
                ChainError::PromotionConflict(format!("rebuild chain does not link: {}", e))
            })?;
        }
        fresh.last_applied_seq = records.last().map_or(0, |r| r.seq);

        let mut state = self
            .state
            .lock()
            .map_err(|_| ChainError::IoError("state mutex poisoned".to_string()))?;
        self.wal.rewrite(&records)?;
        let height = fresh.blocks.len();

        // Existing snapshots may describe the displaced chain; drop them and
        // write one for the new chain so recovery never seeds from a dead
        // branch.
        if let Err(e) = self.snapshots.purge() {
            error!("Snapshot purge after rebuild failed: {}", e);
        }
        if let Some(tip) = fresh.tip() {
            let snapshot = Snapshot {
                height: tip.height,
                tip_hash: fresh.tip_hash(),
                state_root: fresh.state_root(),
                blocks: fresh.blocks.clone(),
                wal_seq_at_snapshot: fresh.last_applied_seq,
            };
            if let Err(e) = self.snapshots.write(&snapshot) {
                error!("Snapshot write after rebuild failed: {}", e);
            }
        }

        *state = fresh;
        drop(state);

        self.set_status(StoreStatus::Ready);
        warn!("Chain rebuilt: {} blocks now canonical", height);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read API (used by the fork tracker, replication and CLI collaborators)
    // ------------------------------------------------------------------

    /// Number of canonical blocks (next expected height).
    pub fn height(&self) -> u64 {
        self.state.lock().map(|s| s.blocks.len() as u64).unwrap_or(0)
    }

    pub fn tip_height(&self) -> Option<u64> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.tip().map(|b| b.height))
    }

    pub fn tip_hash(&self) -> Hash {
        self.state.lock().map(|s| s.tip_hash()).unwrap_or(ZERO_HASH)
    }

    pub fn last_applied_seq(&self) -> u64 {
        self.state.lock().map(|s| s.last_applied_seq).unwrap_or(0)
    }

    pub fn has_block(&self, hash: &Hash) -> bool {
        self.state
            .lock()
            .map(|s| s.index.contains_key(hash))
            .unwrap_or(false)
    }

    pub fn block_by_hash(&self, hash: &Hash) -> Result<Block> {
        let state = self
            .state
            .lock()
            .map_err(|_| ChainError::IoError("state mutex poisoned".to_string()))?;
        state
            .index
            .get(hash)
            .map(|h| state.blocks[*h as usize].clone())
            .ok_or_else(|| ChainError::BlockNotFound(hex::encode(hash)))
    }

    pub fn block_at(&self, height: u64) -> Result<Block> {
        let state = self
            .state
            .lock()
            .map_err(|_| ChainError::IoError("state mutex poisoned".to_string()))?;
        state
            .blocks
            .get(height as usize)
            .cloned()
            .ok_or_else(|| ChainError::BlockNotFound(format!("height {}", height)))
    }

    /// Canonical blocks in `[start, end]`, clamped to what exists.
    pub fn block_range(&self, start: u64, end: u64) -> Vec<Block> {
        match self.state.lock() {
            Ok(state) => state
                .blocks
                .iter()
                .filter(|b| b.height >= start && b.height <= end)
                .cloned()
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn state_root(&self) -> Hash {
        self.state.lock().map(|s| s.state_root()).unwrap_or(ZERO_HASH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store_config(dir: &std::path::Path, interval: u64) -> LedgerConfig {
        LedgerConfig {
            wal_path: dir.join("ledger.wal").to_string_lossy().into_owned(),
            snapshot_path: dir.join("snapshots").to_string_lossy().into_owned(),
            snapshot_interval: interval,
        }
    }

    fn chain_of(len: u64) -> Vec<Block> {
        let mut blocks = Vec::new();
        let mut parent = ZERO_HASH;
        for h in 0..len {
            let block = Block::new(h, parent, format!("block-{}", h).into_bytes());
            parent = block.hash;
            blocks.push(block);
        }
        blocks
    }

    fn ready_store(cfg: &LedgerConfig) -> ChainStore {
        let store = ChainStore::open(cfg).unwrap();
        store.recover().unwrap();
        store
    }

    #[test]
    fn test_commit_and_read_back() {
        let dir = tempdir().unwrap();
        let cfg = store_config(dir.path(), 100);
        let store = ready_store(&cfg);

        for block in chain_of(4) {
            store.commit_block(block).unwrap();
        }
        assert_eq!(store.height(), 4);
        assert_eq!(store.tip_height(), Some(3));
        let tip = store.block_at(3).unwrap();
        assert_eq!(store.tip_hash(), tip.hash);
        assert!(store.has_block(&tip.hash));
        assert_eq!(store.block_by_hash(&tip.hash).unwrap(), tip);
    }

    #[test]
    fn test_commit_rejects_non_extending_block() {
        let dir = tempdir().unwrap();
        let cfg = store_config(dir.path(), 100);
        let store = ready_store(&cfg);

        let chain = chain_of(3);
        store.commit_block(chain[0].clone()).unwrap();
        // Skipping height 1 must fail and leave state untouched.
        assert!(store.commit_block(chain[2].clone()).is_err());
        assert_eq!(store.height(), 1);
    }

    #[test]
    fn test_recover_replays_wal() {
        let dir = tempdir().unwrap();
        let cfg = store_config(dir.path(), 100);
        let chain = chain_of(5);
        {
            let store = ready_store(&cfg);
            for block in chain.clone() {
                store.commit_block(block).unwrap();
            }
        }

        let store = ready_store(&cfg);
        assert_eq!(store.height(), 5);
        assert_eq!(store.tip_hash(), chain[4].hash);
    }

    #[test]
    fn test_snapshot_plus_wal_equals_full_replay() {
        let dir_a = tempdir().unwrap();
        let dir_b = tempdir().unwrap();
        // Same commits; one store snapshots every 2 blocks, the other never.
        let cfg_a = store_config(dir_a.path(), 2);
        let cfg_b = store_config(dir_b.path(), 1_000);
        let chain = chain_of(7);

        for cfg in [&cfg_a, &cfg_b] {
            let store = ready_store(cfg);
            for block in chain.clone() {
                store.commit_block(block).unwrap();
            }
        }

        let recovered_a = ready_store(&cfg_a);
        let recovered_b = ready_store(&cfg_b);
        assert_eq!(recovered_a.height(), recovered_b.height());
        assert_eq!(recovered_a.tip_hash(), recovered_b.tip_hash());
        assert_eq!(recovered_a.state_root(), recovered_b.state_root());
    }

    #[test]
    fn test_commit_refused_before_recover() {
        let dir = tempdir().unwrap();
        let cfg = store_config(dir.path(), 100);
        let store = ChainStore::open(&cfg).unwrap();
        let block = chain_of(1).pop().unwrap();
        match store.commit_block(block) {
            Err(ChainError::NotReady(_)) => {}
            other => panic!("expected NotReady, got {:?}", other),
        }
    }

    #[test]
    fn test_rebuild_switches_chains_and_rewrites_wal() {
        let dir = tempdir().unwrap();
        let cfg = store_config(dir.path(), 100);
        let store = ready_store(&cfg);

        for block in chain_of(3) {
            store.commit_block(block).unwrap();
        }

        let replacement = chain_of(5);
        store.rebuild(replacement.clone()).unwrap();
        assert_eq!(store.height(), 5);
        assert_eq!(store.tip_hash(), replacement[4].hash);

        // The rewritten WAL must recover the rebuilt chain.
        drop(store);
        let recovered = ready_store(&cfg);
        assert_eq!(recovered.height(), 5);
        assert_eq!(recovered.tip_hash(), replacement[4].hash);
    }

    #[test]
    fn test_rebuild_rejects_tampered_block() {
        let dir = tempdir().unwrap();
        let cfg = store_config(dir.path(), 100);
        let store = ready_store(&cfg);
        for block in chain_of(2) {
            store.commit_block(block).unwrap();
        }

        let mut bad = chain_of(4);
        bad[2].payload = b"tampered".to_vec();
        match store.rebuild(bad) {
            Err(ChainError::PromotionConflict(_)) => {}
            other => panic!("expected PromotionConflict, got {:?}", other),
        }
        // Canonical chain unchanged.
        assert_eq!(store.height(), 2);
    }

    #[test]
    fn test_block_range_clamps() {
        let dir = tempdir().unwrap();
        let cfg = store_config(dir.path(), 100);
        let store = ready_store(&cfg);
        for block in chain_of(4) {
            store.commit_block(block).unwrap();
        }
        let range = store.block_range(2, 10);
        assert_eq!(range.len(), 2);
        assert_eq!(range[0].height, 2);
    }
}
