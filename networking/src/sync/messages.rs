use std::fmt;

use containers::{Block, BlockInfo, BlockNo, Bytes32};
use libp2p_identity::PeerId;
use tokio::sync::oneshot;

use super::{RunId, SyncError};

/// Sender of a stop or close request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Syncer,
    Finder,
    HashFetcher,
    BlockFetcher,
    /// Anything outside the pipeline, e.g. an operator or the sync manager.
    External,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Component::Syncer => "syncer",
            Component::Finder => "finder",
            Component::HashFetcher => "hash_fetcher",
            Component::BlockFetcher => "block_fetcher",
            Component::External => "external",
        };
        f.write_str(name)
    }
}

/// Consecutive hashes starting at `start_no`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashBatch {
    pub start_no: BlockNo,
    pub hashes: Vec<Bytes32>,
}

impl HashBatch {
    pub fn end_no(&self) -> BlockNo {
        self.start_no + self.hashes.len() as BlockNo - 1
    }
}

/// Syncer mailbox.
#[derive(Debug)]
pub enum SyncerMessage {
    /// Start a run against `peer_id`. `locator` is an optional list of local
    /// hashes to use as ancestor candidates; `ack` reports the new run id,
    /// or `None` if the request was ignored.
    SyncStart {
        peer_id: PeerId,
        target_no: BlockNo,
        locator: Vec<Bytes32>,
        ack: Option<oneshot::Sender<Option<RunId>>>,
    },
    FinderResult {
        run: RunId,
        result: Result<BlockInfo, SyncError>,
    },
    /// Blocks that arrived outside the fetcher's own requests.
    BlockChunk {
        peer_id: PeerId,
        blocks: Vec<Block>,
    },
    /// `run: None` stops whatever run is active.
    SyncStop {
        run: Option<RunId>,
        from_who: Component,
        err: Option<SyncError>,
    },
    CloseFetcher {
        run: RunId,
        from_who: Component,
    },
}

/// Broadcast to subscribers of the syncer.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Finished {
        run: RunId,
        peer_id: PeerId,
        from_who: Component,
        result: Result<(), SyncError>,
    },
    FetcherClosed {
        run: RunId,
        name: Component,
    },
}
