//! Replication scheduler: bootstrap and catch-up sync from peers
//!
//! The scheduler computes the missing height range against the advertised
//! peer tip, splits it into chunks and works through them on a fixed pool of
//! workers fed by a job queue, so `max_concurrent` is a structural bound
//! rather than a convention. Dispatch is additionally paced to
//! `chunks_per_sec`. Each chunk is requested from up to `fanout` peers at
//! once and the first well-formed response wins; a chunk that times out is
//! retried with exponential backoff and surfaced as failed only once its
//! attempts are exhausted.

use crate::block::Block;
use crate::config::ReplicationConfig;
use crate::error::{ChainError, Result};
use crate::fork::{ForkTracker, IngestOutcome};
use crate::store::ChainStore;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

pub type PeerId = String;

/// Transport seam: delivers byte-for-byte what a remote peer answered.
/// Discovery and wire framing live outside this crate.
#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn advertised_height(&self, peer: &PeerId) -> Result<u64>;
    async fn fetch_range(&self, peer: &PeerId, start: u64, end: u64) -> Result<Vec<Block>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    InFlight,
    Done,
    Failed,
}

/// One chunk of blocks to fetch. Owned by the scheduler only.
#[derive(Debug, Clone)]
pub struct ReplicationJob {
    pub range_start: u64,
    pub range_end: u64,
    pub attempt: u32,
    pub status: JobStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Syncing,
    Synced,
    Failed,
}

/// Aggregate outcome of one sync round.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub target_height: u64,
    pub jobs_total: usize,
    pub jobs_failed: usize,
    pub blocks_ingested: u64,
}

pub struct ReplicationScheduler {
    cfg: ReplicationConfig,
    client: Arc<dyn PeerClient>,
    store: Arc<ChainStore>,
    tracker: Arc<ForkTracker>,
    state: Arc<RwLock<SyncState>>,
}

impl ReplicationScheduler {
    pub fn new(
        cfg: ReplicationConfig,
        client: Arc<dyn PeerClient>,
        store: Arc<ChainStore>,
        tracker: Arc<ForkTracker>,
    ) -> Self {
        ReplicationScheduler {
            cfg,
            client,
            store,
            tracker,
            state: Arc::new(RwLock::new(SyncState::Idle)),
        }
    }

    pub async fn state(&self) -> SyncState {
        *self.state.read().await
    }

    /// Runs one sync round against the given peers. Chunk failures are
    /// retried locally and reported in aggregate, never as a hard error;
    /// cancellation abandons in-flight jobs and keeps whatever was already
    /// ingested.
    pub async fn sync(
        &self,
        peers: &[PeerId],
        cancel: watch::Receiver<bool>,
    ) -> Result<SyncReport> {
        if peers.is_empty() {
            return Err(ChainError::PeerDisagreement("no peers available".to_string()));
        }
        *self.state.write().await = SyncState::Syncing;

        let target = match self.agreed_target(peers).await {
            Ok(target) => target,
            Err(e) => {
                *self.state.write().await = SyncState::Idle;
                return Err(e);
            }
        };

        let start = self.store.height();
        if target < start {
            info!("Already caught up (local {}, peers {})", start, target);
            *self.state.write().await = SyncState::Synced;
            return Ok(SyncReport {
                target_height: target,
                ..SyncReport::default()
            });
        }

        let jobs = self.plan_jobs(start, target);
        let jobs_total = jobs.len();
        info!(
            "Syncing heights {}..={} in {} chunk(s) from {} peer(s)",
            start,
            target,
            jobs_total,
            peers.len()
        );

        let (job_tx, job_rx) = mpsc::channel::<ReplicationJob>(self.cfg.max_concurrent);
        let job_rx = Arc::new(tokio::sync::Mutex::new(job_rx));

        // Feeder paces dispatch to the configured chunk rate.
        let pace = Duration::from_micros(1_000_000 / u64::from(self.cfg.chunks_per_sec.max(1)));
        let feeder_cancel = cancel.clone();
        let feeder = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pace.max(Duration::from_micros(1)));
            for job in jobs {
                ticker.tick().await;
                if *feeder_cancel.borrow() {
                    break;
                }
                if job_tx.send(job).await.is_err() {
                    break;
                }
            }
        });

        let mut workers = Vec::with_capacity(self.cfg.max_concurrent);
        for _ in 0..self.cfg.max_concurrent {
            let worker_peers = peers.to_vec();
            let worker_rx = job_rx.clone();
            let worker_cancel = cancel.clone();
            let cfg = self.cfg.clone();
            let client = self.client.clone();
            let tracker = self.tracker.clone();
            workers.push(tokio::spawn(async move {
                run_worker(cfg, client, tracker, worker_peers, worker_rx, worker_cancel).await
            }));
        }

        let mut report = SyncReport {
            target_height: target,
            jobs_total,
            ..SyncReport::default()
        };
        for worker in workers {
            match worker.await {
                Ok((failed, ingested)) => {
                    report.jobs_failed += failed;
                    report.blocks_ingested += ingested;
                }
                Err(e) => warn!("Sync worker panicked: {}", e),
            }
        }
        feeder.abort();

        if report.jobs_failed > 0 {
            warn!(
                "{} of {} chunk(s) failed after exhausting retries",
                report.jobs_failed, report.jobs_total
            );
            *self.state.write().await = SyncState::Failed;
        } else {
            *self.state.write().await = SyncState::Synced;
        }
        Ok(report)
    }

    /// Queries every peer and picks the highest tip height that at least
    /// `peer_threshold` peers agree on, so one lying or stale peer cannot
    /// define the sync target.
    async fn agreed_target(&self, peers: &[PeerId]) -> Result<u64> {
        let mut votes: HashMap<u64, usize> = HashMap::new();
        for peer in peers {
            match tokio::time::timeout(
                self.cfg.request_timeout(),
                self.client.advertised_height(peer),
            )
            .await
            {
                Ok(Ok(height)) => {
                    *votes.entry(height).or_insert(0) += 1;
                }
                Ok(Err(e)) => debug!("Peer {} height query failed: {}", peer, e),
                Err(_) => debug!("Peer {} height query timed out", peer),
            }
        }

        votes
            .into_iter()
            .filter(|(_, count)| *count >= self.cfg.peer_threshold)
            .map(|(height, _)| height)
            .max()
            .ok_or_else(|| {
                ChainError::PeerDisagreement(format!(
                    "fewer than {} peers agree on a tip height",
                    self.cfg.peer_threshold
                ))
            })
    }

    fn plan_jobs(&self, start: u64, target: u64) -> Vec<ReplicationJob> {
        let mut jobs = Vec::new();
        let mut cursor = start;
        while cursor <= target {
            let end = (cursor + self.cfg.sync_batch_size - 1).min(target);
            jobs.push(ReplicationJob {
                range_start: cursor,
                range_end: end,
                attempt: 0,
                status: JobStatus::Pending,
            });
            cursor = end + 1;
        }
        jobs
    }
}

/// Worker loop: pulls jobs off the shared queue until it closes or the sync
/// is cancelled. Returns (jobs failed, blocks ingested).
async fn run_worker(
    cfg: ReplicationConfig,
    client: Arc<dyn PeerClient>,
    tracker: Arc<ForkTracker>,
    peers: Vec<PeerId>,
    job_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<ReplicationJob>>>,
    mut cancel: watch::Receiver<bool>,
) -> (usize, u64) {
    let mut failed = 0usize;
    let mut ingested = 0u64;

    loop {
        if *cancel.borrow() {
            break;
        }
        let job = {
            let mut rx = job_rx.lock().await;
            tokio::select! {
                _ = cancel.changed() => None,
                job = rx.recv() => job,
            }
        };
        let Some(mut job) = job else { break };

        loop {
            job.attempt += 1;
            match fetch_with_fanout(&cfg, &client, &peers, &job).await {
                Some(blocks) => {
                    for block in blocks {
                        match tracker.ingest(block) {
                            Ok(IngestOutcome::Duplicate) => {}
                            Ok(_) => ingested += 1,
                            Err(e) => warn!("Synced block rejected: {}", e),
                        }
                    }
                    job.status = JobStatus::Done;
                    break;
                }
                None => {
                    if job.attempt >= cfg.max_attempts {
                        warn!(
                            "Chunk {}..={} failed after {} attempt(s)",
                            job.range_start, job.range_end, job.attempt
                        );
                        job.status = JobStatus::Failed;
                        failed += 1;
                        break;
                    }
                    let delay = cfg.retry_backoff() * 2u32.saturating_pow(job.attempt - 1);
                    tokio::select! {
                        _ = cancel.changed() => {
                            // Abandoned, not failed: cancellation is not an error.
                            return (failed, ingested);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        debug!(
            "Chunk {}..={} finished {:?} after {} attempt(s)",
            job.range_start, job.range_end, job.status, job.attempt
        );
    }
    (failed, ingested)
}

/// Requests one chunk from up to `fanout` random distinct peers; the first
/// well-formed response within the request timeout wins, duplicates are
/// dropped on the floor.
async fn fetch_with_fanout(
    cfg: &ReplicationConfig,
    client: &Arc<dyn PeerClient>,
    peers: &[PeerId],
    job: &ReplicationJob,
) -> Option<Vec<Block>> {
    let chosen: Vec<PeerId> = {
        let mut rng = rand::thread_rng();
        peers
            .choose_multiple(&mut rng, cfg.fanout.min(peers.len()))
            .cloned()
            .collect()
    };
    if chosen.is_empty() {
        return None;
    }

    let (tx, mut rx) = mpsc::channel::<Vec<Block>>(chosen.len());
    let mut handles = Vec::with_capacity(chosen.len());
    for peer in chosen {
        let client = client.clone();
        let tx = tx.clone();
        let (start, end) = (job.range_start, job.range_end);
        handles.push(tokio::spawn(async move {
            match client.fetch_range(&peer, start, end).await {
                Ok(blocks) => {
                    let _ = tx.send(blocks).await;
                }
                Err(e) => debug!("Fetch {}..={} from {} failed: {}", start, end, peer, e),
            }
        }));
    }
    drop(tx);

    let start = job.range_start;
    let end = job.range_end;
    let winner = tokio::time::timeout(cfg.request_timeout(), async {
        while let Some(blocks) = rx.recv().await {
            if chunk_is_well_formed(&blocks, start, end) {
                return Some(blocks);
            }
            warn!("Discarding malformed chunk for {}..={}", start, end);
        }
        None
    })
    .await;

    for handle in &handles {
        handle.abort();
    }
    winner.ok().flatten()
}

/// Shape check before a chunk is handed to ingestion: exactly the requested
/// range, contiguous heights and hash-linked. A partial range is rejected so
/// a peer serving truncated responses cannot win the fanout race and leave
/// the job marked done short of the agreed target.
fn chunk_is_well_formed(blocks: &[Block], start: u64, end: u64) -> bool {
    if blocks.len() as u64 != end - start + 1 {
        return false;
    }
    for (i, block) in blocks.iter().enumerate() {
        if block.height != start + i as u64 {
            return false;
        }
        if i > 0 && block.parent_hash != blocks[i - 1].hash {
            return false;
        }
    }
    true
}
