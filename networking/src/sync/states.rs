use serde::Serialize;

/// Syncer state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    /// No sync run in progress.
    Idle,

    /// Finding state: Searching for the highest block shared with the peer.
    ///
    /// Only the Finder is active. Success moves to Fetching, failure back
    /// to Idle.
    Finding,

    /// Fetching state: Downloading hashes and blocks from the ancestor to the
    /// target and applying them.
    ///
    /// The hash fetcher and the block fetcher run concurrently. The run ends
    /// in Idle whether it completes, fails, or is stopped.
    Fetching,
}

impl SyncState {
    /// Check if a transition to the target state is valid.
    pub fn can_transition_to(&self, target: SyncState) -> bool {
        match self {
            SyncState::Idle => matches!(target, SyncState::Finding),
            SyncState::Finding => matches!(target, SyncState::Fetching | SyncState::Idle),
            SyncState::Fetching => matches!(target, SyncState::Idle),
        }
    }

    pub fn is_running(&self) -> bool {
        *self != SyncState::Idle
    }
}

impl Default for SyncState {
    fn default() -> Self {
        SyncState::Idle
    }
}
