use std::{sync::Arc, time::Duration};

use anyhow::Result;
use chain::{ChainAccessor, ChainError, block_locator};
use containers::{Block, Bytes32, TxHash};
use libp2p_identity::PeerId;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, trace, warn};

use super::{RunId, SyncError, SyncEvent, SyncManagerConfig, SyncerHandle};
use crate::{
    requester::{PeerRequester, request_with_timeout},
    types::{NewBlockNotice, OutboundP2pRequest, P2pRequestSink},
};

/// The range sync currently admitted by the manager.
#[derive(Debug, Clone)]
pub struct SyncWorker {
    peer_id: PeerId,
    stop_hash: Bytes32,
    syncer: SyncerHandle,
}

impl SyncWorker {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn stop_hash(&self) -> Bytes32 {
        self.stop_hash
    }

    /// Forward blocks to the syncer's ordered-apply path.
    pub fn put_add_block(&self, blocks: Vec<Block>) -> Result<(), SyncError> {
        self.syncer.push_blocks(self.peer_id, blocks)
    }
}

#[derive(Debug, Default)]
struct SyncGate {
    syncing: bool,
    worker: Option<SyncWorker>,
}

/// Peer-facing front of the sync engine.
///
/// Filters block and transaction announcements through bounded LRU caches
/// and admits at most one range sync at a time. Requests to peers go out
/// through the P2P sink; their responses come back through the handlers.
pub struct SyncManager<C, N, S> {
    config: SyncManagerConfig,
    chain: Arc<C>,
    network: Arc<N>,
    syncer: SyncerHandle,
    p2p: S,
    block_cache: Mutex<LruCache<Bytes32, ()>>,
    tx_cache: Mutex<LruCache<TxHash, ()>>,
    gate: Arc<Mutex<SyncGate>>,
}

impl<C, N, S> SyncManager<C, N, S>
where
    C: ChainAccessor,
    N: PeerRequester,
    S: P2pRequestSink<OutboundP2pRequest>,
{
    pub fn new(
        config: SyncManagerConfig,
        chain: Arc<C>,
        network: Arc<N>,
        syncer: SyncerHandle,
        p2p: S,
    ) -> Self {
        Self {
            block_cache: Mutex::new(LruCache::new(config.block_cache_size)),
            tx_cache: Mutex::new(LruCache::new(config.tx_cache_size)),
            gate: Arc::default(),
            config,
            chain,
            network,
            syncer,
            p2p,
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.gate.lock().syncing
    }

    pub fn worker(&self) -> Option<SyncWorker> {
        self.gate.lock().worker.clone()
    }

    /// A peer announced a block. Ask for it back if it is new to us.
    ///
    /// Announcements are ignored while a range sync runs; the run will bring
    /// the chain up to date anyway.
    pub async fn handle_new_block_notice(&self, peer_id: PeerId, notice: NewBlockNotice) -> Result<()> {
        if self.is_syncing() {
            trace!(peer = %peer_id, no = notice.block_no, "Syncing, ignoring block notice");
            return Ok(());
        }

        if Self::contains_or_add(&self.block_cache, notice.block_hash) {
            trace!(peer = %peer_id, hash = %notice.block_hash.short(), "Duplicate block notice");
            return Ok(());
        }

        match self.chain.get_block(&notice.block_hash) {
            Ok(_) => {
                debug!(peer = %peer_id, no = notice.block_no, "Announced block already known");
                Ok(())
            }
            Err(ChainError::BlockNotFound(hash)) => {
                debug!(peer = %peer_id, no = notice.block_no, hash = %hash.short(), "Requesting announced block");
                self.p2p
                    .send(OutboundP2pRequest::GetBlocks {
                        peer_id,
                        hashes: vec![hash],
                    })
                    .await
            }
            Err(err) => Err(err.into()),
        }
    }

    /// A peer announced transactions. Request the ones not seen before in a
    /// single batch.
    pub async fn handle_new_tx_notice(&self, peer_id: PeerId, hashes: Vec<TxHash>) -> Result<()> {
        let unseen: Vec<TxHash> = hashes
            .into_iter()
            .filter(|hash| !Self::contains_or_add(&self.tx_cache, *hash))
            .collect();

        if unseen.is_empty() {
            return Ok(());
        }

        trace!(peer = %peer_id, count = unseen.len(), "Requesting announced transactions");
        self.p2p
            .send(OutboundP2pRequest::GetTransactions {
                peer_id,
                hashes: unseen,
            })
            .await
    }

    /// Blocks a peer sent us, either requested by hash or pushed.
    ///
    /// With a range sync running they go to it. Otherwise they are added to
    /// the chain directly; a block with an unknown parent starts a range sync
    /// towards it.
    pub fn handle_get_block_response(&self, peer_id: PeerId, blocks: Vec<Block>) -> Result<()> {
        if let Some(worker) = self.worker() {
            worker.put_add_block(blocks)?;
            return Ok(());
        }

        for block in blocks {
            let info = block.info();
            match self.chain.add_block(block) {
                Ok(()) => debug!(peer = %peer_id, block = %info, "Added block from peer"),
                Err(ChainError::AlreadyExists { .. }) => {
                    trace!(peer = %peer_id, block = %info, "Block already known");
                }
                Err(ChainError::UnknownParent { .. }) => {
                    let locator = block_locator(&*self.chain, self.config.locator_size)?
                        .into_iter()
                        .map(|info| info.hash)
                        .collect();
                    info!(peer = %peer_id, block = %info, "Parent unknown, starting range sync");
                    self.do_sync(peer_id, locator, info.hash);
                    break;
                }
                Err(err) => {
                    warn!(peer = %peer_id, block = %info, error = %err, "Rejected block from peer");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Start a range sync with `peer_id` up to the block `stop_hash`.
    ///
    /// `hashes` are local block hashes offered to the peer as ancestor
    /// candidates. Returns false if another range sync holds the gate. The
    /// gate is released when the run ends, however it ends.
    pub fn do_sync(&self, peer_id: PeerId, hashes: Vec<Bytes32>, stop_hash: Bytes32) -> bool {
        let worker = SyncWorker {
            peer_id,
            stop_hash,
            syncer: self.syncer.clone(),
        };

        {
            let mut gate = self.gate.lock();
            if gate.syncing {
                info!(
                    peer = %peer_id,
                    stop_hash = %stop_hash.short(),
                    "Range sync already running, ignoring request"
                );
                return false;
            }
            gate.syncing = true;
            gate.worker = Some(worker);
        }

        let job = WorkerJob {
            network: Arc::clone(&self.network),
            syncer: self.syncer.clone(),
            gate: Arc::clone(&self.gate),
            fetch_timeout: self.config.fetch_timeout,
            peer_id,
            hashes,
            stop_hash,
        };
        tokio::spawn(job.run());

        true
    }

    fn contains_or_add<K: std::hash::Hash + Eq>(cache: &Mutex<LruCache<K, ()>>, key: K) -> bool {
        let mut cache = cache.lock();
        if cache.contains(&key) {
            return true;
        }
        cache.put(key, ());
        false
    }
}

/// Drives one admitted range sync and releases the gate afterwards.
struct WorkerJob<N> {
    network: Arc<N>,
    syncer: SyncerHandle,
    gate: Arc<Mutex<SyncGate>>,
    fetch_timeout: Duration,
    peer_id: PeerId,
    hashes: Vec<Bytes32>,
    stop_hash: Bytes32,
}

impl<N: PeerRequester> WorkerJob<N> {
    async fn run(self) {
        match self.sync().await {
            Ok(Some(run)) => info!(peer = %self.peer_id, run = %run, "Range sync done"),
            Ok(None) => debug!(peer = %self.peer_id, "Syncer declined range sync"),
            Err(err) => warn!(peer = %self.peer_id, error = %err, "Range sync failed"),
        }

        let mut gate = self.gate.lock();
        gate.syncing = false;
        gate.worker = None;
    }

    async fn sync(&self) -> Result<Option<RunId>, SyncError> {
        let stop_block = request_with_timeout(
            "get block by hash",
            self.fetch_timeout,
            self.network.get_block_by_hash(self.peer_id, self.stop_hash),
        )
        .await?;

        if stop_block.hash() != self.stop_hash {
            return Err(SyncError::MalformedResponse(format!(
                "asked for block {}, got {}",
                self.stop_hash,
                stop_block.hash()
            )));
        }

        let mut events = self.syncer.subscribe();
        let Some(run) = self
            .syncer
            .start_sync(self.peer_id, stop_block.block_no(), self.hashes.clone())
            .await?
        else {
            return Ok(None);
        };

        loop {
            match events.recv().await {
                Ok(SyncEvent::Finished {
                    run: finished, result, ..
                }) if finished == run => return result.map(|()| Some(run)),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(run = %run, skipped, "Missed sync events");
                    if self.syncer.current_run() != Some(run) {
                        return Err(SyncError::Internal(format!(
                            "lost the end of run {run}"
                        )));
                    }
                }
                Err(RecvError::Closed) => return Err(SyncError::SyncerClosed),
            }
        }
    }
}
