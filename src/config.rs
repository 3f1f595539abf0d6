//! Configuration management for ChainLedger

use serde::Deserialize;
use std::fs;
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
}

/// Durability settings consumed by the chain store.
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    pub wal_path: String,
    pub snapshot_path: String,
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval: u64,
}

/// Concurrency and retry limits for peer synchronization.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicationConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_chunks_per_sec")]
    pub chunks_per_sec: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_peer_threshold")]
    pub peer_threshold: usize,
    #[serde(default = "default_fanout")]
    pub fanout: usize,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_sync_batch_size")]
    pub sync_batch_size: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl ReplicationConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            chunks_per_sec: default_chunks_per_sec(),
            retry_backoff_ms: default_retry_backoff_ms(),
            peer_threshold: default_peer_threshold(),
            fanout: default_fanout(),
            request_timeout_ms: default_request_timeout_ms(),
            sync_batch_size: default_sync_batch_size(),
            max_attempts: default_max_attempts(),
        }
    }
}

pub fn load_config() -> Result<Config, Box<dyn std::error::Error>> {
    let config_str = fs::read_to_string("config.toml").unwrap_or_default();
    let config: Config = if config_str.is_empty() {
        // Provide sane defaults when config.toml is absent
        Config {
            ledger: LedgerConfig {
                wal_path: "./data/ledger.wal".to_string(),
                snapshot_path: "./data/snapshots".to_string(),
                snapshot_interval: default_snapshot_interval(),
            },
            replication: ReplicationConfig::default(),
        }
    } else {
        toml::from_str(&config_str)?
    };

    // Validate critical values
    if config.ledger.wal_path.is_empty() {
        return Err("ledger.wal_path must be set in config.toml".into());
    }

    if config.ledger.snapshot_path.is_empty() {
        return Err("ledger.snapshot_path must be set in config.toml".into());
    }

    if config.ledger.snapshot_interval == 0 {
        return Err("ledger.snapshot_interval must be at least 1".into());
    }

    if config.replication.max_concurrent == 0 {
        return Err("replication.max_concurrent must be at least 1".into());
    }

    if config.replication.fanout == 0 {
        return Err("replication.fanout must be at least 1".into());
    }

    if config.replication.sync_batch_size == 0 {
        return Err("replication.sync_batch_size must be at least 1".into());
    }

    Ok(config)
}

fn default_snapshot_interval() -> u64 {
    128
}

fn default_max_concurrent() -> usize {
    4
}

fn default_chunks_per_sec() -> u32 {
    16
}

fn default_retry_backoff_ms() -> u64 {
    250
}

fn default_peer_threshold() -> usize {
    1
}

fn default_fanout() -> usize {
    2
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_sync_batch_size() -> u64 {
    100
}

fn default_max_attempts() -> u32 {
    3
}
