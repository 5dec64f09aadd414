mod block_fetcher_tests;
mod finder_tests;
mod hash_fetcher_tests;

use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, bail};
use async_trait::async_trait;
use chain::{ChainAccessor, MemoryChain};
use containers::{Block, BlockInfo, BlockNo, Bytes32};
use libp2p_identity::PeerId;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::{RunId, SyncContext, SyncEvent, SyncerConfig};
use crate::{
    loopback::LoopbackRequester,
    requester::{BlockChunk, PeerRequester},
};

/// Local chain of `local_height` and a peer chain sharing blocks up to
/// `fork_at`, then diverging up to `peer_height`.
fn chains(local_height: BlockNo, fork_at: BlockNo, peer_height: BlockNo) -> (Arc<MemoryChain>, Arc<MemoryChain>) {
    let local = MemoryChain::generate(local_height, 1);
    let peer = local.fork(fork_at, peer_height, 2);
    (Arc::new(local), Arc::new(peer))
}

fn test_config() -> SyncerConfig {
    SyncerConfig {
        max_hash_req_size: 20,
        max_block_req_size: 10,
        fetch_timeout: Duration::from_secs(5),
        max_block_fetch_retry: 1,
        ..SyncerConfig::default()
    }
}

fn context(target_no: BlockNo, best_no: BlockNo, ancestor: Option<BlockInfo>) -> SyncContext {
    let mut ctx = SyncContext::new(RunId(1), PeerId::random(), target_no, best_no);
    if let Some(ancestor) = ancestor {
        ctx.set_ancestor(ancestor).unwrap();
    }
    ctx
}

fn info_at(chain: &MemoryChain, no: BlockNo) -> BlockInfo {
    chain.get_block_by_number(no).unwrap().info()
}

/// Wait for the `Finished` event of `run`.
async fn wait_finished(events: &mut broadcast::Receiver<SyncEvent>, run: RunId) -> SyncEvent {
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            match events.recv().await.unwrap() {
                event @ SyncEvent::Finished { run: finished, .. } if finished == run => return event,
                _ => {}
            }
        }
    })
    .await
    .unwrap()
}

/// Peer backed by a loopback chain with fault injection and call counters.
struct TestPeer {
    inner: LoopbackRequester<MemoryChain>,
    /// Never answer anything.
    silent: bool,
    /// Answer every ancestor request with "none of them".
    ancestor_unsupported: bool,
    /// Never answer block requests starting at or above this height.
    silent_blocks_from: Option<BlockNo>,
    /// Fail this many block requests before serving them.
    block_failures: AtomicUsize,
    delayed_chunks: Mutex<HashSet<BlockNo>>,
    ancestor_calls: AtomicUsize,
    hash_probes: AtomicUsize,
    hash_requests: AtomicUsize,
    max_hash_count: AtomicU64,
    block_requests: AtomicUsize,
}

impl TestPeer {
    fn new(chain: Arc<MemoryChain>) -> Self {
        Self {
            inner: LoopbackRequester::new(chain),
            silent: false,
            ancestor_unsupported: false,
            silent_blocks_from: None,
            block_failures: AtomicUsize::new(0),
            delayed_chunks: Mutex::new(HashSet::new()),
            ancestor_calls: AtomicUsize::new(0),
            hash_probes: AtomicUsize::new(0),
            hash_requests: AtomicUsize::new(0),
            max_hash_count: AtomicU64::new(0),
            block_requests: AtomicUsize::new(0),
        }
    }

    fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    fn ancestor_unsupported(mut self) -> Self {
        self.ancestor_unsupported = true;
        self
    }

    fn silent_blocks_from(mut self, no: BlockNo) -> Self {
        self.silent_blocks_from = Some(no);
        self
    }

    fn chain(&self) -> &Arc<MemoryChain> {
        self.inner.chain()
    }

    async fn hang_if_silent(&self) {
        if self.silent {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl PeerRequester for TestPeer {
    async fn get_ancestor(&self, peer_id: PeerId, hashes: Vec<Bytes32>) -> Result<Option<BlockInfo>> {
        self.hang_if_silent().await;
        self.ancestor_calls.fetch_add(1, Ordering::SeqCst);
        if self.ancestor_unsupported {
            return Ok(None);
        }
        self.inner.get_ancestor(peer_id, hashes).await
    }

    async fn get_hashes_by_range(&self, peer_id: PeerId, from: BlockNo, count: u64) -> Result<Vec<Bytes32>> {
        self.hang_if_silent().await;
        self.hash_requests.fetch_add(1, Ordering::SeqCst);
        self.max_hash_count.fetch_max(count, Ordering::SeqCst);
        self.inner.get_hashes_by_range(peer_id, from, count).await
    }

    async fn get_blocks_by_range(&self, peer_id: PeerId, from: BlockNo, count: u64) -> Result<BlockChunk> {
        self.hang_if_silent().await;
        self.block_requests.fetch_add(1, Ordering::SeqCst);

        if self.silent_blocks_from.is_some_and(|silent| from >= silent) {
            std::future::pending::<()>().await;
        }

        let failed = self
            .block_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            bail!("connection reset");
        }

        let delayed = self.delayed_chunks.lock().contains(&from);
        if delayed {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        self.inner.get_blocks_by_range(peer_id, from, count).await
    }

    async fn get_block_by_hash(&self, peer_id: PeerId, hash: Bytes32) -> Result<Block> {
        self.hang_if_silent().await;
        self.inner.get_block_by_hash(peer_id, hash).await
    }

    async fn get_hash_by_no(&self, _peer_id: PeerId, no: BlockNo) -> Result<Bytes32> {
        self.hang_if_silent().await;
        self.hash_probes.fetch_add(1, Ordering::SeqCst);
        Ok(self.chain().get_block_by_number(no)?.hash())
    }
}
