use std::sync::Arc;

use chain::{ChainAccessor, block_locator};
use containers::{BlockInfo, BlockNo, Bytes32};
use libp2p_identity::PeerId;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info};

use super::{SyncContext, SyncError, SyncerConfig, SyncerMessage};
use crate::requester::{PeerRequester, request_with_timeout};

/// Ancestor finder task of one run.
///
/// Posts exactly one `FinderResult` to the syncer unless stopped first.
pub struct Finder {
    handle: Option<JoinHandle<()>>,
}

impl Finder {
    pub fn start<C: ChainAccessor, N: PeerRequester>(
        ctx: &SyncContext,
        chain: Arc<C>,
        network: Arc<N>,
        config: &SyncerConfig,
        locator: Vec<Bytes32>,
        syncer_tx: mpsc::UnboundedSender<SyncerMessage>,
    ) -> Self {
        let run = ctx.run;
        let search = AncestorSearch::new(ctx, chain, network, config);

        let handle = tokio::spawn(async move {
            let result = search.find(&locator).await;
            if syncer_tx
                .send(SyncerMessage::FinderResult { run, result })
                .is_err()
            {
                debug!(run = %run, "Syncer gone, dropping finder result");
            }
        });

        Self {
            handle: Some(handle),
        }
    }

    /// Cancel the in-flight probe. Safe to call more than once.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for Finder {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Common ancestor search against one peer.
pub struct AncestorSearch<C, N> {
    chain: Arc<C>,
    network: Arc<N>,
    peer_id: PeerId,
    target_no: BlockNo,
    config: SyncerConfig,
}

impl<C: ChainAccessor, N: PeerRequester> AncestorSearch<C, N> {
    pub fn new(ctx: &SyncContext, chain: Arc<C>, network: Arc<N>, config: &SyncerConfig) -> Self {
        Self {
            chain,
            network,
            peer_id: ctx.peer_id,
            target_no: ctx.target_no,
            config: config.clone(),
        }
    }

    /// Highest block both chains have at the same height.
    ///
    /// Tries a light scan first: one round trip over `locator` (or the latest
    /// local hashes if it is empty). Falls back to a binary search over
    /// single-hash probes when the peer recognises none of the candidates.
    pub async fn find(&self, locator: &[Bytes32]) -> Result<BlockInfo, SyncError> {
        let best_no = self.chain.get_best_block()?.block_no();
        let upper = best_no.min(self.target_no);

        let ancestor = if self.config.use_full_scan_only {
            None
        } else {
            self.light_scan(locator, upper).await?
        };

        let ancestor = match ancestor {
            Some((known, hi)) if known.no >= hi => known,
            Some((known, hi)) => self.full_scan(known, hi).await?,
            None => {
                let genesis = self.chain.get_block_by_number(0)?.info();
                if self.probe(genesis.no).await? != genesis.hash {
                    return Err(SyncError::DifferentChain {
                        peer: self.peer_id,
                    });
                }
                self.full_scan(genesis, upper).await?
            }
        };

        info!(
            peer = %self.peer_id,
            ancestor = %ancestor,
            target_no = self.target_no,
            "Found common ancestor"
        );

        Ok(ancestor)
    }

    /// Returns the highest shared candidate and the highest height the true
    /// ancestor can be at.
    async fn light_scan(
        &self,
        locator: &[Bytes32],
        upper: BlockNo,
    ) -> Result<Option<(BlockInfo, BlockNo)>, SyncError> {
        let mut candidates: Vec<BlockInfo> = if locator.is_empty() {
            block_locator(&*self.chain, self.config.light_scan_size)?
        } else {
            locator
                .iter()
                .filter_map(|hash| self.chain.get_block(hash).ok())
                .map(|block| block.info())
                .collect()
        };
        candidates.retain(|info| info.no <= upper);
        candidates.sort_by(|a, b| b.no.cmp(&a.no));
        candidates.dedup_by_key(|info| info.no);

        if candidates.is_empty() {
            return Ok(None);
        }

        let hashes = candidates.iter().map(|info| info.hash).collect();
        let answer = request_with_timeout(
            "get ancestor",
            self.config.fetch_timeout,
            self.network.get_ancestor(self.peer_id, hashes),
        )
        .await?;

        let Some(answer) = answer else {
            debug!(peer = %self.peer_id, candidates = candidates.len(), "Light scan found nothing");
            return Ok(None);
        };

        let known = candidates
            .iter()
            .copied()
            .find(|info| info.hash == answer.hash)
            .ok_or_else(|| {
                SyncError::MalformedResponse(format!("ancestor {answer} is not a candidate"))
            })?;

        // Every candidate above the answer is unknown to the peer.
        let hi = candidates
            .iter()
            .filter(|info| info.no > known.no)
            .map(|info| info.no - 1)
            .min()
            .unwrap_or(upper);

        debug!(peer = %self.peer_id, known = %known, hi, "Light scan matched");
        Ok(Some((known, hi)))
    }

    /// Binary search in `(known.no, hi]` for the highest matching height.
    /// `known` must already be shared.
    async fn full_scan(&self, known: BlockInfo, hi: BlockNo) -> Result<BlockInfo, SyncError> {
        let mut lo = known.no;
        let mut lo_hash = known.hash;
        let mut hi = hi;

        while lo < hi {
            let mid = lo + (hi - lo).div_ceil(2);
            let local = self.chain.get_block_by_number(mid)?.hash();

            if self.probe(mid).await? == local {
                lo = mid;
                lo_hash = local;
            } else {
                hi = mid - 1;
            }
        }

        Ok(BlockInfo::new(lo_hash, lo))
    }

    async fn probe(&self, no: BlockNo) -> Result<Bytes32, SyncError> {
        request_with_timeout(
            "get hash by number",
            self.config.fetch_timeout,
            self.network.get_hash_by_no(self.peer_id, no),
        )
        .await
    }
}
