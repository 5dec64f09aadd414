use std::sync::Arc;

use arc_swap::ArcSwap;
use containers::{BlockInfo, BlockNo};
use serde::Serialize;

use super::{RunId, SyncState};

/// Progress of the block fetcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatSnapshot {
    pub last_added: Option<BlockInfo>,
    pub max_requested: Option<BlockNo>,
}

/// Progress counters written by the block fetcher and read by anyone.
///
/// Readers always see a consistent pair of values without locking. Both
/// values only ever move forward.
#[derive(Debug, Default)]
pub struct SyncStat {
    snapshot: ArcSwap<StatSnapshot>,
}

impl SyncStat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_last_added(&self, info: BlockInfo) {
        self.snapshot.rcu(|current| {
            if current.last_added.is_some_and(|last| last.no >= info.no) {
                return Arc::clone(current);
            }
            Arc::new(StatSnapshot {
                last_added: Some(info),
                ..**current
            })
        });
    }

    pub fn update_max_requested(&self, no: BlockNo) {
        self.snapshot.rcu(|current| {
            if current.max_requested.is_some_and(|max| max >= no) {
                return Arc::clone(current);
            }
            Arc::new(StatSnapshot {
                max_requested: Some(no),
                ..**current
            })
        });
    }

    pub fn snapshot(&self) -> StatSnapshot {
        **self.snapshot.load()
    }
}

/// Externally visible view of the syncer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatistics {
    pub running: bool,
    pub state: SyncState,
    pub run: Option<RunId>,
    /// Blocks from the common ancestor to the target.
    pub total: Option<u64>,
    pub start: Option<BlockNo>,
    pub end: Option<BlockNo>,
    pub block_added: Option<BlockNo>,
    pub block_requested: Option<BlockNo>,
}

impl SyncStatistics {
    pub fn idle() -> Self {
        Self {
            running: false,
            state: SyncState::Idle,
            run: None,
            total: None,
            start: None,
            end: None,
            block_added: None,
            block_requested: None,
        }
    }
}
