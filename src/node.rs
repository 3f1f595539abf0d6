use crate::block::{Block, BlockVerifier, WeightFn};
use crate::config::{load_config, Config};
use crate::error::{ChainError, Result};
use crate::fork::{ForkInfo, ForkTracker, IngestOutcome};
use crate::replication::{PeerClient, PeerId, ReplicationScheduler, SyncReport};
use crate::store::ChainStore;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeState {
    Booting,
    Recovering,
    Ready,
    Degraded,
}

/// Top-level wiring for a ledger node: durable store, fork tracker and
/// replication scheduler over one injected peer transport.
pub struct LedgerNode {
    pub config: Config,
    pub store: Arc<ChainStore>,
    pub tracker: Arc<ForkTracker>,
    pub scheduler: ReplicationScheduler,
    pub peers: Arc<RwLock<Vec<PeerId>>>,
    pub state: Arc<RwLock<NodeState>>,
    cancel_tx: watch::Sender<bool>,
}

impl LedgerNode {
    /// Loads config.toml (or defaults) and boots from it.
    pub fn init(
        client: Arc<dyn PeerClient>,
        verifier: BlockVerifier,
        weight_fn: WeightFn,
    ) -> std::result::Result<Self, Box<dyn std::error::Error>> {
        let config = load_config()?;
        let _ = tracing_subscriber::fmt::try_init();
        Ok(Self::with_config(config, client, verifier, weight_fn)?)
    }

    /// Boots the node from an explicit config: open the store, run recovery,
    /// wire the tracker and scheduler. A store that recovery marks corrupted
    /// leaves the node Degraded instead of failing startup, so an operator
    /// can still drive `recover_longest_fork`.
    pub fn with_config(
        config: Config,
        client: Arc<dyn PeerClient>,
        verifier: BlockVerifier,
        weight_fn: WeightFn,
    ) -> Result<Self> {
        info!(
            "Starting ledger node (wal = {}, snapshots = {})",
            config.ledger.wal_path, config.ledger.snapshot_path
        );

        let store = Arc::new(ChainStore::open(&config.ledger)?);
        let state = match store.recover() {
            Ok(()) => {
                info!("Recovery complete at height {}", store.height());
                NodeState::Ready
            }
            Err(e) => {
                error!("Recovery failed, node is degraded: {}", e);
                NodeState::Degraded
            }
        };

        let tracker = Arc::new(ForkTracker::new(store.clone(), verifier, weight_fn));
        let scheduler = ReplicationScheduler::new(
            config.replication.clone(),
            client,
            store.clone(),
            tracker.clone(),
        );
        let (cancel_tx, _) = watch::channel(false);

        Ok(LedgerNode {
            config,
            store,
            tracker,
            scheduler,
            peers: Arc::new(RwLock::new(Vec::new())),
            state: Arc::new(RwLock::new(state)),
            cancel_tx,
        })
    }

    pub async fn state(&self) -> NodeState {
        self.state.read().await.clone()
    }

    /// Feeds a locally produced or gossiped block through the same ingest
    /// path replication uses.
    pub fn submit_block(&self, block: Block) -> Result<IngestOutcome> {
        self.tracker.ingest(block)
    }

    pub fn list_forks(&self) -> Vec<ForkInfo> {
        self.tracker.list_forks()
    }

    pub fn resolve_forks(&self) -> Result<crate::block::Hash> {
        self.tracker.resolve_forks()
    }

    /// Operator escape hatch after corruption or a deep split. On success
    /// the node leaves the Degraded state.
    pub async fn recover_longest_fork(&self) -> Result<crate::block::Hash> {
        {
            let mut s = self.state.write().await;
            *s = NodeState::Recovering;
        }
        match self.tracker.recover_longest_fork() {
            Ok(tip) => {
                info!("Recovered to heaviest known fork, tip {}", hex::encode(tip));
                let mut s = self.state.write().await;
                *s = NodeState::Ready;
                Ok(tip)
            }
            Err(e) => {
                warn!("Fork recovery failed: {}", e);
                let mut s = self.state.write().await;
                *s = NodeState::Degraded;
                Err(e)
            }
        }
    }

    /// Runs one catch-up round against the currently known peers.
    pub async fn sync(&self) -> Result<SyncReport> {
        let peers = self.peers.read().await.clone();
        if peers.is_empty() {
            return Err(ChainError::PeerDisagreement(
                "no peers discovered yet".to_string(),
            ));
        }
        self.scheduler.sync(&peers, self.cancel_tx.subscribe()).await
    }

    pub async fn on_peer_discovered(&self, peer: PeerId) {
        let mut peers = self.peers.write().await;
        if !peers.contains(&peer) {
            info!("Peer discovered: {}", peer);
            peers.push(peer);
        }
    }

    /// Signals any in-flight sync to abandon its remaining jobs.
    pub fn shutdown(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Operator-facing status summary, shaped for a dashboard or CLI.
    pub async fn status_report(&self) -> serde_json::Value {
        serde_json::json!({
            "state": format!("{:?}", self.state().await),
            "store_status": format!("{:?}", self.store.status()),
            "height": self.store.height(),
            "tip_hash": hex::encode(self.store.tip_hash()),
            "last_wal_seq": self.store.last_applied_seq(),
            "peers": self.peers.read().await.len(),
            "forks": self.list_forks(),
            "orphans": self.tracker.orphan_count(),
        })
    }
}
