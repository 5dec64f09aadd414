use std::fmt;

use containers::{BlockInfo, BlockNo};
use libp2p_identity::PeerId;
use serde::Serialize;

use super::SyncError;

/// Identifies one sync run. Every message between components carries it so
/// that late messages from a finished run can be recognised and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
pub struct RunId(pub u64);

impl RunId {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Parameters of the run in progress.
#[derive(Debug, Clone)]
pub struct SyncContext {
    pub run: RunId,
    pub peer_id: PeerId,
    pub target_no: BlockNo,
    /// Local best height when the run started.
    pub start_best_no: BlockNo,
    common_ancestor: Option<BlockInfo>,
    total_count: u64,
}

impl SyncContext {
    pub fn new(run: RunId, peer_id: PeerId, target_no: BlockNo, start_best_no: BlockNo) -> Self {
        Self {
            run,
            peer_id,
            target_no,
            start_best_no,
            common_ancestor: None,
            total_count: 0,
        }
    }

    /// Record the common ancestor. It can only be set once per run.
    pub fn set_ancestor(&mut self, ancestor: BlockInfo) -> Result<(), SyncError> {
        if let Some(existing) = self.common_ancestor {
            return Err(SyncError::Internal(format!(
                "common ancestor already set to {existing}"
            )));
        }
        if ancestor.no > self.target_no {
            return Err(SyncError::MalformedResponse(format!(
                "ancestor {ancestor} is above target {}",
                self.target_no
            )));
        }

        self.common_ancestor = Some(ancestor);
        self.total_count = self.target_no - ancestor.no;
        Ok(())
    }

    pub fn ancestor(&self) -> Option<BlockInfo> {
        self.common_ancestor
    }

    /// Blocks between the ancestor and the target.
    pub fn total_count(&self) -> u64 {
        self.total_count
    }
}
