use std::{future::Future, time::Duration};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use containers::{Block, BlockInfo, BlockNo, Bytes32};
use libp2p_identity::PeerId;
use tokio::time::timeout;

use crate::sync::SyncError;

/// Blocks returned for a range request, and whether the peer has more
/// blocks after the last one returned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockChunk {
    pub blocks: Vec<Block>,
    pub has_next: bool,
}

/// Request/response calls the sync engine makes to a remote peer.
///
/// Abstracts the wire protocol so the pipeline can run against real peers,
/// the in-process loopback, or test doubles.
#[async_trait]
pub trait PeerRequester: Send + Sync + 'static {
    /// Ask the peer which of `hashes` it has on its main chain.
    ///
    /// Returns the highest known candidate, or `None` if it knows none.
    async fn get_ancestor(&self, peer_id: PeerId, hashes: Vec<Bytes32>)
    -> Result<Option<BlockInfo>>;

    /// Up to `count` consecutive main-chain hashes starting at `from`.
    async fn get_hashes_by_range(
        &self,
        peer_id: PeerId,
        from: BlockNo,
        count: u64,
    ) -> Result<Vec<Bytes32>>;

    async fn get_blocks_by_range(
        &self,
        peer_id: PeerId,
        from: BlockNo,
        count: u64,
    ) -> Result<BlockChunk>;

    async fn get_block_by_hash(&self, peer_id: PeerId, hash: Bytes32) -> Result<Block>;

    /// Hash the peer has at height `no`.
    async fn get_hash_by_no(&self, peer_id: PeerId, no: BlockNo) -> Result<Bytes32> {
        self.get_hashes_by_range(peer_id, no, 1)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("peer has no block at height {no}"))
    }
}

/// Await a peer request, bounding it by `limit`.
pub async fn request_with_timeout<T>(
    what: &'static str,
    limit: Duration,
    request: impl Future<Output = Result<T>>,
) -> Result<T, SyncError> {
    match timeout(limit, request).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(SyncError::transport(what, err)),
        Err(_) => Err(SyncError::Timeout { what, after: limit }),
    }
}
