use std::time::Duration;

use chain::ChainError;
use containers::BlockNo;
use libp2p_identity::PeerId;
use thiserror::Error;

/// Reasons a sync run ends without reaching its target.
///
/// Cloneable so the same error can be reported to the syncer and broadcast
/// to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("{what} timed out after {after:?}")]
    Timeout { what: &'static str, after: Duration },

    #[error("peer {peer} is on a different chain")]
    DifferentChain { peer: PeerId },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("blocks {from}..={to} failed after {retries} retries: {reason}")]
    BlockFetchFailed {
        from: BlockNo,
        to: BlockNo,
        retries: usize,
        reason: String,
    },

    #[error("hash stream ended at {next_no} before target {target_no}")]
    HashStreamEnded { next_no: BlockNo, target_no: BlockNo },

    #[error("sync stopped")]
    Stopped,

    #[error("syncer is closed")]
    SyncerClosed,

    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    pub fn transport(what: &'static str, err: anyhow::Error) -> Self {
        SyncError::Transport(format!("{what}: {err:#}"))
    }
}
