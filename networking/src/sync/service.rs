use std::sync::Arc;

use arc_swap::ArcSwap;
use chain::ChainAccessor;
use containers::{Block, BlockInfo, BlockNo, Bytes32};
use libp2p_identity::PeerId;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{
    BlockFetcher, Component, Finder, HashFetcher, RunId, SyncContext, SyncError, SyncEvent,
    SyncStat, SyncState, SyncStatistics, SyncerConfig, SyncerMessage,
    config::{HASH_BATCH_QUEUE_SIZE, SYNC_EVENT_CAPACITY},
};
use crate::requester::PeerRequester;

/// What readers outside the syncer task can see.
#[derive(Debug, Default)]
struct SyncerView {
    state: SyncState,
    ctx: Option<SyncContext>,
    stat: Option<Arc<SyncStat>>,
}

/// Sync orchestrator.
///
/// Owns at most one run at a time and sequences
/// Finder -> (HashFetcher + BlockFetcher). All state changes happen on the
/// syncer's own task while handling a mailbox message.
pub struct Syncer<C, N> {
    config: SyncerConfig,
    chain: Arc<C>,
    network: Arc<N>,
    state: SyncState,
    last_run: RunId,
    ctx: Option<SyncContext>,
    finder: Option<Finder>,
    hash_fetcher: Option<HashFetcher>,
    block_fetcher: Option<BlockFetcher>,
    /// Blocks pushed while no block fetcher was running.
    dropped_blocks: u64,
    /// Weak so the task ends once every handle and component is gone.
    mailbox: mpsc::WeakUnboundedSender<SyncerMessage>,
    receiver: mpsc::UnboundedReceiver<SyncerMessage>,
    events: broadcast::Sender<SyncEvent>,
    view: Arc<ArcSwap<SyncerView>>,
}

impl<C: ChainAccessor, N: PeerRequester> Syncer<C, N> {
    pub fn new(
        chain: Arc<C>,
        network: Arc<N>,
        config: SyncerConfig,
    ) -> (Self, SyncerHandle) {
        let (mailbox, receiver) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(SYNC_EVENT_CAPACITY);
        let view = Arc::new(ArcSwap::from_pointee(SyncerView::default()));

        let handle = SyncerHandle {
            mailbox: mailbox.clone(),
            events: events.clone(),
            view: Arc::clone(&view),
        };

        let syncer = Self {
            config,
            chain,
            network,
            state: SyncState::default(),
            last_run: RunId::default(),
            ctx: None,
            finder: None,
            hash_fetcher: None,
            block_fetcher: None,
            dropped_blocks: 0,
            mailbox: mailbox.downgrade(),
            receiver,
            events,
            view,
        };

        (syncer, handle)
    }

    /// Run a syncer on its own task.
    pub fn spawn(chain: Arc<C>, network: Arc<N>, config: SyncerConfig) -> SyncerHandle {
        let (syncer, handle) = Self::new(chain, network, config);
        tokio::spawn(syncer.run());
        handle
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn dropped_blocks(&self) -> u64 {
        self.dropped_blocks
    }

    /// Handle messages until every handle and component sender is dropped.
    pub async fn run(mut self) {
        while let Some(message) = self.receiver.recv().await {
            self.handle_message(message);
        }
        self.reset();
        debug!(last_run = %self.last_run, "Syncer stopped");
    }

    pub fn handle_message(&mut self, message: SyncerMessage) {
        match message {
            SyncerMessage::SyncStart {
                peer_id,
                target_no,
                locator,
                ack,
            } => {
                let run = self.handle_sync_start(peer_id, target_no, locator);
                if let Some(ack) = ack {
                    let _ = ack.send(run);
                }
            }
            SyncerMessage::FinderResult { run, result } => self.handle_finder_result(run, result),
            SyncerMessage::BlockChunk { peer_id, blocks } => self.handle_block_chunk(peer_id, blocks),
            SyncerMessage::SyncStop { run, from_who, err } => {
                self.handle_sync_stop(run, from_who, err)
            }
            SyncerMessage::CloseFetcher { run, from_who } => {
                self.handle_close_fetcher(run, from_who)
            }
        }
    }

    fn handle_sync_start(
        &mut self,
        peer_id: PeerId,
        target_no: BlockNo,
        locator: Vec<Bytes32>,
    ) -> Option<RunId> {
        if self.state != SyncState::Idle {
            debug!(
                peer = %peer_id,
                target_no,
                state = ?self.state,
                "Sync already running, ignoring start"
            );
            return None;
        }

        let best_no = match self.chain.get_best_block() {
            Ok(best) => best.block_no(),
            Err(err) => {
                warn!(error = %err, "Cannot read best block, ignoring sync start");
                return None;
            }
        };

        if target_no <= best_no {
            debug!(peer = %peer_id, target_no, best_no, "Peer is not ahead, ignoring sync start");
            return None;
        }

        let Some(mailbox) = self.mailbox.upgrade() else {
            debug!(peer = %peer_id, "Syncer is shutting down, ignoring sync start");
            return None;
        };

        let run = self.last_run.next();
        self.last_run = run;

        let ctx = SyncContext::new(run, peer_id, target_no, best_no);
        self.finder = Some(Finder::start(
            &ctx,
            Arc::clone(&self.chain),
            Arc::clone(&self.network),
            &self.config,
            locator,
            mailbox,
        ));
        self.ctx = Some(ctx);
        self.transition_to(SyncState::Finding);

        info!(run = %run, peer = %peer_id, target_no, best_no, "Sync started");
        Some(run)
    }

    fn handle_finder_result(&mut self, run: RunId, result: Result<BlockInfo, SyncError>) {
        if !self.is_current(run) || self.state != SyncState::Finding {
            debug!(run = %run, "Dropping stale finder result");
            return;
        }

        let started = result.and_then(|ancestor| self.start_fetchers(ancestor));
        if let Err(err) = started {
            self.finish(Component::Finder, Err(err));
        }
    }

    fn start_fetchers(&mut self, ancestor: BlockInfo) -> Result<(), SyncError> {
        let local = self.chain.get_block(&ancestor.hash)?;
        if local.block_no() != ancestor.no {
            return Err(SyncError::Internal(format!(
                "ancestor {ancestor} is at height {} locally",
                local.block_no()
            )));
        }

        let ctx = self
            .ctx
            .as_mut()
            .ok_or_else(|| SyncError::Internal("no sync context".into()))?;
        ctx.set_ancestor(ancestor)?;
        let ctx = ctx.clone();

        if let Some(mut finder) = self.finder.take() {
            finder.stop();
        }

        let mailbox = self.mailbox.upgrade().ok_or(SyncError::SyncerClosed)?;
        let (hand_off, hashes) = mpsc::channel(HASH_BATCH_QUEUE_SIZE);
        let block_fetcher = BlockFetcher::start(
            &ctx,
            Arc::clone(&self.chain),
            Arc::clone(&self.network),
            &self.config,
            hashes,
            mailbox.clone(),
        )?;
        let hash_fetcher = HashFetcher::start(
            &ctx,
            Arc::clone(&self.network),
            &self.config,
            hand_off,
            mailbox,
        )?;

        self.block_fetcher = Some(block_fetcher);
        self.hash_fetcher = Some(hash_fetcher);
        self.transition_to(SyncState::Fetching);

        info!(
            run = %ctx.run,
            ancestor = %ancestor,
            target_no = ctx.target_no,
            total = ctx.total_count(),
            "Fetching blocks"
        );
        Ok(())
    }

    /// Pushed blocks are best effort. They are dropped unless a block fetcher
    /// is running, which includes the Finding phase of a run.
    fn handle_block_chunk(&mut self, peer_id: PeerId, blocks: Vec<Block>) {
        let count = blocks.len();
        let delivered = self
            .block_fetcher
            .as_ref()
            .is_some_and(|fetcher| fetcher.push_blocks(blocks));
        if delivered {
            return;
        }

        self.dropped_blocks += count as u64;
        debug!(
            peer = %peer_id,
            count,
            dropped_total = self.dropped_blocks,
            state = ?self.state,
            "No block fetcher running, dropping pushed blocks"
        );
    }

    fn handle_sync_stop(&mut self, run: Option<RunId>, from_who: Component, err: Option<SyncError>) {
        if let Some(run) = run.filter(|run| !self.is_current(*run)) {
            debug!(run = %run, from_who = %from_who, "Dropping stale stop");
            return;
        }
        if self.state == SyncState::Idle {
            debug!(from_who = %from_who, "Not running, ignoring stop");
            return;
        }

        let result = match err {
            Some(err) => Err(err),
            None if from_who == Component::BlockFetcher => Ok(()),
            None => Err(SyncError::Stopped),
        };
        self.finish(from_who, result);
    }

    fn handle_close_fetcher(&mut self, run: RunId, from_who: Component) {
        if !self.is_current(run) {
            debug!(run = %run, from_who = %from_who, "Dropping stale close");
            return;
        }

        match from_who {
            Component::HashFetcher => {
                if let Some(mut fetcher) = self.hash_fetcher.take() {
                    fetcher.stop();
                }
            }
            other => {
                warn!(run = %run, from_who = %other, "Only the hash fetcher can be closed");
                return;
            }
        }

        debug!(run = %run, name = %from_who, "Fetcher closed");
        let _ = self.events.send(SyncEvent::FetcherClosed {
            run,
            name: from_who,
        });
    }

    /// End the current run, return to Idle and tell subscribers.
    fn finish(&mut self, from_who: Component, result: Result<(), SyncError>) {
        let Some(ctx) = self.ctx.clone() else {
            self.reset();
            return;
        };

        let last_added = self
            .block_fetcher
            .as_ref()
            .and_then(|fetcher| fetcher.stat().snapshot().last_added);

        match &result {
            Ok(()) => info!(
                run = %ctx.run,
                peer = %ctx.peer_id,
                target_no = ctx.target_no,
                "Sync finished"
            ),
            Err(err) => warn!(
                run = %ctx.run,
                peer = %ctx.peer_id,
                from_who = %from_who,
                last_added = ?last_added,
                error = %err,
                "Sync failed"
            ),
        }

        self.reset();

        let _ = self.events.send(SyncEvent::Finished {
            run: ctx.run,
            peer_id: ctx.peer_id,
            from_who,
            result,
        });
    }

    /// Stop every component and drop the run.
    fn reset(&mut self) {
        if let Some(mut finder) = self.finder.take() {
            finder.stop();
        }
        if let Some(mut fetcher) = self.hash_fetcher.take() {
            fetcher.stop();
        }
        if let Some(mut fetcher) = self.block_fetcher.take() {
            fetcher.stop();
        }

        self.ctx = None;
        self.state = SyncState::Idle;
        self.publish();
    }

    fn transition_to(&mut self, target: SyncState) {
        if !self.state.can_transition_to(target) {
            warn!(from = ?self.state, to = ?target, "Unexpected sync state transition");
        }
        self.state = target;
        self.publish();
    }

    fn is_current(&self, run: RunId) -> bool {
        self.ctx.as_ref().is_some_and(|ctx| ctx.run == run)
    }

    fn publish(&self) {
        self.view.store(Arc::new(SyncerView {
            state: self.state,
            ctx: self.ctx.clone(),
            stat: self
                .block_fetcher
                .as_ref()
                .map(|fetcher| Arc::clone(fetcher.stat())),
        }));
    }
}

/// Cloneable access to a running syncer.
#[derive(Debug, Clone)]
pub struct SyncerHandle {
    mailbox: mpsc::UnboundedSender<SyncerMessage>,
    events: broadcast::Sender<SyncEvent>,
    view: Arc<ArcSwap<SyncerView>>,
}

impl SyncerHandle {
    fn send(&self, message: SyncerMessage) -> Result<(), SyncError> {
        self.mailbox
            .send(message)
            .map_err(|_| SyncError::SyncerClosed)
    }

    /// Ask for a run without waiting to learn whether it was admitted.
    pub fn request_sync(&self, peer_id: PeerId, target_no: BlockNo) -> Result<(), SyncError> {
        self.send(SyncerMessage::SyncStart {
            peer_id,
            target_no,
            locator: Vec::new(),
            ack: None,
        })
    }

    /// Ask for a run. Returns its id, or `None` if the syncer ignored the
    /// request because a run is active or the peer is not ahead.
    pub async fn start_sync(
        &self,
        peer_id: PeerId,
        target_no: BlockNo,
        locator: Vec<Bytes32>,
    ) -> Result<Option<RunId>, SyncError> {
        let (ack, admitted) = oneshot::channel();
        self.send(SyncerMessage::SyncStart {
            peer_id,
            target_no,
            locator,
            ack: Some(ack),
        })?;
        admitted.await.map_err(|_| SyncError::SyncerClosed)
    }

    pub fn push_blocks(&self, peer_id: PeerId, blocks: Vec<Block>) -> Result<(), SyncError> {
        self.send(SyncerMessage::BlockChunk { peer_id, blocks })
    }

    /// Stop the active run, if any. Does not wait.
    pub fn stop(&self) -> Result<(), SyncError> {
        self.send(SyncerMessage::SyncStop {
            run: None,
            from_who: Component::External,
            err: None,
        })
    }

    pub fn close_fetcher(&self, run: RunId, name: Component) -> Result<(), SyncError> {
        self.send(SyncerMessage::CloseFetcher {
            run,
            from_who: name,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> SyncState {
        self.view.load().state
    }

    pub fn current_run(&self) -> Option<RunId> {
        self.view.load().ctx.as_ref().map(|ctx| ctx.run)
    }

    pub fn statistics(&self) -> SyncStatistics {
        let view = self.view.load();
        let Some(ctx) = &view.ctx else {
            return SyncStatistics::idle();
        };

        let snapshot = view.stat.as_ref().map(|stat| stat.snapshot()).unwrap_or_default();
        let ancestor = ctx.ancestor();

        SyncStatistics {
            running: view.state.is_running(),
            state: view.state,
            run: Some(ctx.run),
            total: ancestor.map(|_| ctx.total_count()),
            start: ancestor.map(|info| info.no),
            end: Some(ctx.target_no),
            block_added: snapshot.last_added.map(|info| info.no),
            block_requested: snapshot.max_requested,
        }
    }
}
