use anyhow::{Result, anyhow};
use async_trait::async_trait;
use containers::{BlockNo, Bytes32, TxHash};
use libp2p_identity::PeerId;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Announcement of a new block by a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBlockNotice {
    pub block_hash: Bytes32,
    pub block_no: BlockNo,
}

/// Fire-and-forget requests the sync manager hands to the P2P layer.
/// Responses come back through the sync manager's handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundP2pRequest {
    GetBlocks {
        peer_id: PeerId,
        hashes: Vec<Bytes32>,
    },
    GetTransactions {
        peer_id: PeerId,
        hashes: Vec<TxHash>,
    },
}

impl OutboundP2pRequest {
    pub fn peer_id(&self) -> PeerId {
        match self {
            OutboundP2pRequest::GetBlocks { peer_id, .. }
            | OutboundP2pRequest::GetTransactions { peer_id, .. } => *peer_id,
        }
    }
}

#[async_trait]
pub trait P2pRequestSink<M>: Send + Sync + Clone {
    async fn send(&self, message: M) -> Result<()>;
}

#[async_trait]
impl<M: Send + 'static> P2pRequestSink<M> for mpsc::UnboundedSender<M> {
    async fn send(&self, message: M) -> Result<()> {
        self.send(message)
            .map_err(|err| anyhow!("failed to send request to p2p service: {err}"))
    }
}

#[async_trait]
pub trait P2pRequestSource<T>: Send {
    async fn recv(&mut self) -> Option<T>;
}

#[async_trait]
impl<T: Send + 'static> P2pRequestSource<T> for mpsc::UnboundedReceiver<T> {
    async fn recv(&mut self) -> Option<T> {
        mpsc::UnboundedReceiver::recv(self).await
    }
}
