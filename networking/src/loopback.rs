use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chain::ChainAccessor;
use containers::{Block, BlockInfo, BlockNo, Bytes32};
use libp2p_identity::PeerId;
use tracing::trace;

use crate::requester::{BlockChunk, PeerRequester};

/// Maximum number of blocks served in one range response.
pub const MAX_BLOCKS_PER_RESPONSE: u64 = 100;

/// Serves peer requests straight from a local chain.
///
/// This is the serving side of the sync protocol run in-process: the demo
/// node uses it to talk to a simulated peer and the tests wrap it to inject
/// faults. The `peer_id` argument of every call is ignored.
pub struct LoopbackRequester<C> {
    chain: Arc<C>,
}

impl<C: ChainAccessor> LoopbackRequester<C> {
    pub fn new(chain: Arc<C>) -> Self {
        Self { chain }
    }

    pub fn chain(&self) -> &Arc<C> {
        &self.chain
    }
}

impl<C> Clone for LoopbackRequester<C> {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
        }
    }
}

#[async_trait]
impl<C: ChainAccessor> PeerRequester for LoopbackRequester<C> {
    async fn get_ancestor(
        &self,
        peer_id: PeerId,
        hashes: Vec<Bytes32>,
    ) -> Result<Option<BlockInfo>> {
        let ancestor = hashes
            .iter()
            .filter_map(|hash| self.chain.get_block(hash).ok())
            .map(|block| block.info())
            .max_by_key(|info| info.no);

        trace!(peer = %peer_id, candidates = hashes.len(), ancestor = ?ancestor, "Served get ancestor");
        Ok(ancestor)
    }

    async fn get_hashes_by_range(
        &self,
        _peer_id: PeerId,
        from: BlockNo,
        count: u64,
    ) -> Result<Vec<Bytes32>> {
        let mut hashes = Vec::new();
        for no in from..from.saturating_add(count) {
            match self.chain.get_block_by_number(no) {
                Ok(block) => hashes.push(block.hash()),
                Err(_) => break,
            }
        }
        Ok(hashes)
    }

    async fn get_blocks_by_range(
        &self,
        _peer_id: PeerId,
        from: BlockNo,
        count: u64,
    ) -> Result<BlockChunk> {
        let served = count.min(MAX_BLOCKS_PER_RESPONSE);
        let mut blocks = Vec::new();
        for no in from..from.saturating_add(served) {
            match self.chain.get_block_by_number(no) {
                Ok(block) => blocks.push(block),
                Err(_) => break,
            }
        }

        let next_no = from + blocks.len() as BlockNo;
        let has_next = self.chain.get_block_by_number(next_no).is_ok();
        Ok(BlockChunk { blocks, has_next })
    }

    async fn get_block_by_hash(&self, _peer_id: PeerId, hash: Bytes32) -> Result<Block> {
        Ok(self.chain.get_block(&hash)?)
    }
}
