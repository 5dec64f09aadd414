/// Chain synchronization engine.
///
/// Brings the local chain up to date with a peer that reported a longer
/// chain. A sync run goes through three stages:
///
/// - **Finder**: locates the highest block both chains share
/// - **HashFetcher**: downloads the block hashes from that ancestor to the
///   peer's target, in bounded batches
/// - **BlockFetcher**: downloads block bodies for those hashes with several
///   concurrent requests and applies them to the chain in height order
///
/// ## Architecture
///
/// Every component runs as its own tokio task and talks to the others only
/// through channels:
/// 1. The `Syncer` owns the run and reacts to messages on its mailbox
/// 2. The Finder posts its result back to the Syncer
/// 3. The HashFetcher feeds resolved hashes to the BlockFetcher over a
///    bounded hand-off queue
/// 4. Both fetchers report completion or failure back to the Syncer
///
/// Messages carry the id of the run they belong to; anything addressed to a
/// run that has already been torn down is dropped.
///
/// ## State Machine
///
/// - **IDLE**: No run in progress
/// - **FINDING**: Looking for the common ancestor
/// - **FETCHING**: Downloading and applying blocks
///
/// The `SyncManager` sits in front of the Syncer and filters peer
/// announcements, admitting at most one run at a time.
pub mod block_fetcher;
pub mod config;
pub mod context;
pub mod error;
pub mod finder;
pub mod hash_fetcher;
pub mod messages;
pub mod service;
pub mod stat;
pub mod states;
pub mod sync_manager;

pub use block_fetcher::BlockFetcher;
pub use config::*;
pub use context::{RunId, SyncContext};
pub use error::SyncError;
pub use finder::Finder;
pub use hash_fetcher::HashFetcher;
pub use messages::{Component, HashBatch, SyncEvent, SyncerMessage};
pub use service::{Syncer, SyncerHandle};
pub use stat::{StatSnapshot, SyncStat, SyncStatistics};
pub use states::SyncState;
pub use sync_manager::{SyncManager, SyncWorker};

#[cfg(test)]
mod tests;
