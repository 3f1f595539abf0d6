//! Error types for ChainLedger

use std::fmt;

#[derive(Debug, Clone)]
pub enum ChainError {
    /// WAL checksum or sequence mismatch. Carries the last sequence number
    /// that replayed cleanly so operators know where the log went bad.
    Corruption { last_good_seq: u64, detail: String },
    Timeout(String),
    PeerDisagreement(String),
    InvalidBlock(String),
    PromotionConflict(String),
    NoEligibleBranch(String),
    NotReady(String),
    WalUnhealthy,
    BlockNotFound(String),
    IoError(String),
    BincodeError(String),
    ConfigError(String),
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChainError::Corruption {
                last_good_seq,
                detail,
            } => write!(f, "WAL corruption after seq {}: {}", last_good_seq, detail),
            ChainError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            ChainError::PeerDisagreement(msg) => write!(f, "Peer disagreement: {}", msg),
            ChainError::InvalidBlock(msg) => write!(f, "Invalid block: {}", msg),
            ChainError::PromotionConflict(msg) => write!(f, "Promotion conflict: {}", msg),
            ChainError::NoEligibleBranch(msg) => write!(f, "No eligible branch: {}", msg),
            ChainError::NotReady(msg) => write!(f, "Store not ready: {}", msg),
            ChainError::WalUnhealthy => write!(f, "WAL is unhealthy; commits are refused"),
            ChainError::BlockNotFound(msg) => write!(f, "Block not found: {}", msg),
            ChainError::IoError(msg) => write!(f, "IO error: {}", msg),
            ChainError::BincodeError(msg) => write!(f, "Bincode error: {}", msg),
            ChainError::ConfigError(msg) => write!(f, "Config error: {}", msg),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::IoError(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for ChainError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        ChainError::BincodeError(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;
