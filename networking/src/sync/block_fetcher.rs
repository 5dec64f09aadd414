use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use chain::{ChainAccessor, ChainError};
use containers::{Block, BlockNo, Bytes32};
use futures::{
    FutureExt, StreamExt,
    future::BoxFuture,
    stream::FuturesUnordered,
};
use libp2p_identity::PeerId;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, trace, warn};

use super::{Component, HashBatch, RunId, SyncContext, SyncError, SyncStat, SyncerConfig, SyncerMessage};
use crate::requester::{BlockChunk, PeerRequester, request_with_timeout};

/// A range of consecutive heights requested in one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTask {
    pub start_no: BlockNo,
    pub count: u64,
    /// Failed attempts so far.
    pub retry: usize,
}

impl FetchTask {
    pub fn end_no(&self) -> BlockNo {
        self.start_no + self.count - 1
    }
}

/// Bookkeeping of the block fetcher, independent of the transport.
///
/// Blocks are applied strictly in ascending height order starting right
/// after the common ancestor. A block is only accepted if its hash matches
/// the hash resolved for its height.
pub struct FetchState<C> {
    chain: Arc<C>,
    stat: Arc<SyncStat>,
    target_no: BlockNo,
    max_block_req_size: u64,
    max_pending_conn: usize,
    max_block_req_tasks: usize,
    max_block_fetch_retry: usize,
    /// Next height to apply.
    next_no: BlockNo,
    /// Start of the next expected hash batch.
    next_hash_no: BlockNo,
    expected: BTreeMap<BlockNo, Bytes32>,
    received: BTreeMap<BlockNo, Block>,
    pending: VecDeque<FetchTask>,
    retry: VecDeque<FetchTask>,
    /// Issued and not yet applied, by start height.
    running: BTreeMap<BlockNo, FetchTask>,
    in_flight: usize,
}

impl<C: ChainAccessor> FetchState<C> {
    pub fn new(ctx: &SyncContext, chain: Arc<C>, stat: Arc<SyncStat>, config: &SyncerConfig) -> Result<Self, SyncError> {
        let ancestor = ctx
            .ancestor()
            .ok_or_else(|| SyncError::Internal("block fetch started without ancestor".into()))?;

        Ok(Self {
            chain,
            stat,
            target_no: ctx.target_no,
            max_block_req_size: config.max_block_req_size.max(1),
            max_pending_conn: config.max_pending_conn.max(1),
            max_block_req_tasks: config.max_block_req_tasks.max(1),
            max_block_fetch_retry: config.max_block_fetch_retry,
            next_no: ancestor.no + 1,
            next_hash_no: ancestor.no + 1,
            expected: BTreeMap::new(),
            received: BTreeMap::new(),
            pending: VecDeque::new(),
            retry: VecDeque::new(),
            running: BTreeMap::new(),
            in_flight: 0,
        })
    }

    pub fn next_no(&self) -> BlockNo {
        self.next_no
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn running(&self) -> usize {
        self.running.len()
    }

    pub fn is_done(&self) -> bool {
        self.next_no > self.target_no
    }

    /// Whether another hash batch can be taken without growing the backlog
    /// of unissued tasks past the pending window.
    pub fn wants_hashes(&self) -> bool {
        self.next_hash_no <= self.target_no && self.pending.len() < self.max_pending_conn
    }

    /// Take the next resolved hash batch and plan requests for it. Blocks
    /// already buffered for those heights are applied right away.
    pub fn add_hash_batch(&mut self, batch: HashBatch) -> Result<usize, SyncError> {
        if batch.hashes.is_empty() {
            return Ok(0);
        }
        if batch.start_no != self.next_hash_no || batch.end_no() > self.target_no {
            return Err(SyncError::Internal(format!(
                "hash batch {}..={} does not continue at {}",
                batch.start_no,
                batch.end_no(),
                self.next_hash_no
            )));
        }

        let end_no = batch.end_no();
        for (no, hash) in (batch.start_no..).zip(batch.hashes) {
            self.expected.insert(no, hash);
        }

        let mut start_no = batch.start_no;
        while start_no <= end_no {
            let count = self.max_block_req_size.min(end_no - start_no + 1);
            self.pending.push_back(FetchTask {
                start_no,
                count,
                retry: 0,
            });
            start_no += count;
        }
        self.next_hash_no = end_no + 1;

        self.apply_ready()
    }

    /// Next task to put on the wire, if the windows allow one.
    ///
    /// Retries go first. New tasks are only issued while fewer than
    /// `max_pending_conn` tasks are waiting to be applied.
    pub fn next_request(&mut self) -> Option<FetchTask> {
        if self.in_flight >= self.max_block_req_tasks {
            return None;
        }

        while let Some(task) = self.retry.pop_front() {
            if self.is_applied(&task) {
                continue;
            }
            self.in_flight += 1;
            return Some(task);
        }

        while self.running.len() < self.max_pending_conn {
            let task = self.pending.pop_front()?;
            if self.is_applied(&task) {
                continue;
            }
            self.running.insert(task.start_no, task);
            self.in_flight += 1;
            self.stat.update_max_requested(task.end_no());
            trace!(start_no = task.start_no, end_no = task.end_no(), "Requesting blocks");
            return Some(task);
        }

        None
    }

    /// Account for a finished request.
    pub fn on_fetched(&mut self, task: FetchTask, result: Result<BlockChunk, SyncError>) -> Result<usize, SyncError> {
        self.in_flight = self.in_flight.saturating_sub(1);

        if self.is_applied(&task) {
            return Ok(0);
        }

        let chunk = match result.and_then(|chunk| self.verify(&task, chunk)) {
            Ok(chunk) => chunk,
            Err(err) => {
                self.reschedule(task, task.retry + 1, err.to_string())?;
                return Ok(0);
            }
        };

        let got = chunk.blocks.len() as u64;
        if got < task.count {
            // The peer may cap its responses. Only count it as a failure when
            // it also says there is nothing more.
            let remainder = FetchTask {
                start_no: task.start_no + got,
                count: task.count - got,
                retry: task.retry,
            };
            self.running.remove(&task.start_no);
            self.running.insert(remainder.start_no, remainder);

            let retry = if chunk.has_next { task.retry } else { task.retry + 1 };
            self.reschedule(remainder, retry, format!("short chunk, got {got} of {}", task.count))?;
        }

        self.handle_block_rsp(chunk.blocks)
    }

    /// The single ordered-apply path for fetched and pushed blocks.
    ///
    /// Blocks below the next height, above the target, or not matching the
    /// resolved hash are dropped. Blocks whose hash is not resolved yet wait
    /// in the buffer and are checked before they are applied. Returns the
    /// number of blocks applied.
    pub fn handle_block_rsp(&mut self, blocks: Vec<Block>) -> Result<usize, SyncError> {
        for block in blocks {
            let no = block.block_no();
            if no < self.next_no || no > self.target_no {
                trace!(no, "Dropping block outside the sync range");
                continue;
            }

            match self.expected.get(&no) {
                Some(hash) if *hash == block.hash() => {
                    self.received.insert(no, block);
                }
                Some(_) => debug!(no, "Dropping block with unexpected hash"),
                None => {
                    self.received.entry(no).or_insert(block);
                }
            }
        }

        self.apply_ready()
    }

    fn apply_ready(&mut self) -> Result<usize, SyncError> {
        let mut applied = 0;

        while let Some(block) = self.received.get(&self.next_no) {
            let no = self.next_no;
            match self.expected.get(&no) {
                None => break,
                Some(hash) if *hash != block.hash() => {
                    debug!(no, "Dropping buffered block with unexpected hash");
                    self.received.remove(&no);
                    break;
                }
                Some(_) => {}
            }

            let Some(block) = self.received.remove(&no) else {
                break;
            };
            let info = block.info();
            match self.chain.add_block(block) {
                Ok(()) | Err(ChainError::AlreadyExists { .. }) => {}
                Err(err) => return Err(err.into()),
            }

            self.expected.remove(&no);
            self.stat.update_last_added(info);
            self.next_no += 1;
            applied += 1;
        }

        if applied > 0 {
            let next_no = self.next_no;
            self.running.retain(|_, task| task.end_no() >= next_no);
            debug!(last_added = next_no - 1, applied, "Applied blocks");
        }

        Ok(applied)
    }

    fn verify(&self, task: &FetchTask, chunk: BlockChunk) -> Result<BlockChunk, SyncError> {
        if chunk.blocks.is_empty() {
            return Err(SyncError::MalformedResponse(format!(
                "empty chunk for {}..={}",
                task.start_no,
                task.end_no()
            )));
        }
        if chunk.blocks.len() as u64 > task.count {
            return Err(SyncError::MalformedResponse(format!(
                "asked for {} blocks, got {}",
                task.count,
                chunk.blocks.len()
            )));
        }

        for (no, block) in (task.start_no..).zip(&chunk.blocks) {
            if block.block_no() != no {
                return Err(SyncError::MalformedResponse(format!(
                    "expected block {no}, got {}",
                    block.block_no()
                )));
            }
            match self.expected.get(&no) {
                Some(hash) if *hash != block.hash() => {
                    return Err(SyncError::MalformedResponse(format!(
                        "block {no} hash {} does not match {hash}",
                        block.hash()
                    )));
                }
                _ => {}
            }
        }

        Ok(chunk)
    }

    fn reschedule(&mut self, task: FetchTask, retry: usize, reason: String) -> Result<(), SyncError> {
        if retry > self.max_block_fetch_retry {
            return Err(SyncError::BlockFetchFailed {
                from: task.start_no,
                to: task.end_no(),
                retries: task.retry,
                reason,
            });
        }

        if retry > task.retry {
            warn!(
                start_no = task.start_no,
                end_no = task.end_no(),
                retry,
                reason,
                "Retrying block fetch"
            );
        }

        let task = FetchTask { retry, ..task };
        self.running.insert(task.start_no, task);
        self.retry.push_back(task);
        Ok(())
    }

    fn is_applied(&self, task: &FetchTask) -> bool {
        task.end_no() < self.next_no
    }
}

type FetchFuture = BoxFuture<'static, (FetchTask, Result<BlockChunk, SyncError>)>;

/// Block download task of one run.
pub struct BlockFetcher {
    handle: Option<JoinHandle<()>>,
    mailbox: mpsc::UnboundedSender<Vec<Block>>,
    stat: Arc<SyncStat>,
}

impl BlockFetcher {
    /// Start consuming `hashes` and applying blocks.
    ///
    /// Reports to the syncer with a `SyncStop` carrying no error once the
    /// target is applied, or the error that ended the run.
    pub fn start<C: ChainAccessor, N: PeerRequester>(
        ctx: &SyncContext,
        chain: Arc<C>,
        network: Arc<N>,
        config: &SyncerConfig,
        hashes: mpsc::Receiver<HashBatch>,
        syncer_tx: mpsc::UnboundedSender<SyncerMessage>,
    ) -> Result<Self, SyncError> {
        let stat = Arc::new(SyncStat::new());
        let state = FetchState::new(ctx, chain, Arc::clone(&stat), config)?;
        let (mailbox, pushed) = mpsc::unbounded_channel();

        let fetch = BlockFetchLoop {
            state,
            network,
            peer_id: ctx.peer_id,
            run: ctx.run,
            target_no: ctx.target_no,
            fetch_timeout: config.fetch_timeout,
        };
        let run = ctx.run;

        let handle = tokio::spawn(async move {
            let err = fetch.run(hashes, pushed).await.err();
            let message = SyncerMessage::SyncStop {
                run: Some(run),
                from_who: Component::BlockFetcher,
                err,
            };
            if syncer_tx.send(message).is_err() {
                debug!(run = %run, "Syncer gone, dropping block fetcher report");
            }
        });

        Ok(Self {
            handle: Some(handle),
            mailbox,
            stat,
        })
    }

    /// Hand blocks received outside the fetcher's own requests to the
    /// ordered-apply path. Returns false once the fetcher has stopped.
    pub fn push_blocks(&self, blocks: Vec<Block>) -> bool {
        self.mailbox.send(blocks).is_ok()
    }

    pub fn stat(&self) -> &Arc<SyncStat> {
        &self.stat
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for BlockFetcher {
    fn drop(&mut self) {
        self.stop();
    }
}

struct BlockFetchLoop<C, N> {
    state: FetchState<C>,
    network: Arc<N>,
    peer_id: PeerId,
    run: RunId,
    target_no: BlockNo,
    fetch_timeout: Duration,
}

impl<C: ChainAccessor, N: PeerRequester> BlockFetchLoop<C, N> {
    async fn run(
        mut self,
        mut hashes: mpsc::Receiver<HashBatch>,
        mut pushed: mpsc::UnboundedReceiver<Vec<Block>>,
    ) -> Result<(), SyncError> {
        let mut in_flight = FuturesUnordered::<FetchFuture>::new();
        let mut hashes_open = true;

        loop {
            while let Some(task) = self.state.next_request() {
                in_flight.push(self.request(task));
            }

            if self.state.is_done() {
                info!(run = %self.run, target_no = self.target_no, "Applied all blocks");
                return Ok(());
            }

            if in_flight.is_empty() && !hashes_open {
                return Err(SyncError::HashStreamEnded {
                    next_no: self.state.next_no(),
                    target_no: self.target_no,
                });
            }
            if in_flight.is_empty() && !self.state.wants_hashes() {
                return Err(SyncError::Internal(format!(
                    "block fetcher stalled at {}",
                    self.state.next_no()
                )));
            }

            tokio::select! {
                batch = hashes.recv(), if hashes_open && self.state.wants_hashes() => match batch {
                    Some(batch) => {
                        self.state.add_hash_batch(batch)?;
                    }
                    None => hashes_open = false,
                },
                Some(blocks) = pushed.recv() => {
                    self.state.handle_block_rsp(blocks)?;
                }
                Some((task, result)) = in_flight.next(), if !in_flight.is_empty() => {
                    self.state.on_fetched(task, result)?;
                }
            }
        }
    }

    fn request(&self, task: FetchTask) -> FetchFuture {
        let network = Arc::clone(&self.network);
        let peer_id = self.peer_id;
        let limit = self.fetch_timeout;

        async move {
            let result = request_with_timeout(
                "get blocks by range",
                limit,
                network.get_blocks_by_range(peer_id, task.start_no, task.count),
            )
            .await;
            (task, result)
        }
        .boxed()
    }
}
