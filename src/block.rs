//! Block primitives shared by the store, fork tracker and replication layers

use crate::error::{ChainError, Result};
use sha2::{Digest, Sha256};
use std::sync::Arc;

pub type Hash = [u8; 32];

pub const ZERO_HASH: Hash = [0u8; 32];

/// Hex-truncated rendering for log lines, e.g. "dead…beef".
pub fn short(hash: &Hash) -> String {
    format!(
        "{}…{}",
        hex::encode(&hash[..2]),
        hex::encode(&hash[30..])
    )
}

/// An immutable, hash-linked unit of the chain. The payload is opaque to this
/// crate; execution semantics live upstream.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Block {
    pub height: u64,
    pub hash: Hash,
    pub parent_hash: Hash,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    pub produced_at: u64,
}

impl Block {
    pub fn new(height: u64, parent_hash: Hash, payload: Vec<u8>) -> Self {
        let produced_at = chrono::Utc::now().timestamp_millis() as u64;
        let hash = Self::compute_hash(height, &parent_hash, &payload, produced_at);
        Block {
            height,
            hash,
            parent_hash,
            payload,
            produced_at,
        }
    }

    pub fn compute_hash(height: u64, parent_hash: &Hash, payload: &[u8], produced_at: u64) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(height.to_le_bytes());
        hasher.update(parent_hash);
        hasher.update(payload);
        hasher.update(produced_at.to_le_bytes());
        hasher.finalize().into()
    }

    /// Recomputes the content hash and compares it to the stored identity.
    pub fn verify_integrity(&self) -> bool {
        self.hash == Self::compute_hash(self.height, &self.parent_hash, &self.payload, self.produced_at)
    }

    /// Structural check used before a peer-delivered block enters the fork
    /// tracker: self-consistent hash and non-reserved identity.
    pub fn check_structure(&self) -> Result<()> {
        if self.hash == ZERO_HASH {
            return Err(ChainError::InvalidBlock("zero hash".to_string()));
        }
        if !self.verify_integrity() {
            return Err(ChainError::InvalidBlock(format!(
                "hash mismatch for block at height {}",
                self.height
            )));
        }
        Ok(())
    }
}

/// Structural verification callback supplied by the consensus layer.
pub type BlockVerifier = Arc<dyn Fn(&Block) -> bool + Send + Sync>;

/// Pluggable per-block weight used by fork choice. The default counts one
/// unit per block; consensus may inject stake or difficulty weighting.
pub type WeightFn = Arc<dyn Fn(&Block) -> u64 + Send + Sync>;

/// Verifier accepting any block that passes the structural self-check.
pub fn structural_verifier() -> BlockVerifier {
    Arc::new(|block: &Block| block.verify_integrity())
}

/// Weight function counting each block as one unit.
pub fn block_count_weight() -> WeightFn {
    Arc::new(|_: &Block| 1)
}
