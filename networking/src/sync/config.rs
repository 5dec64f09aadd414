/// Sync engine configuration.
///
/// Operational parameters for synchronization: batch sizes, timeouts, and limits.
use std::{num::NonZeroUsize, time::Duration};

use nonzero_ext::nonzero;

/// Maximum block hashes requested in one batch.
pub const DEFAULT_HASH_REQ_SIZE: u64 = 1000;

/// Maximum consecutive blocks requested in one chunk.
pub const DEFAULT_BLOCK_REQ_SIZE: u64 = 100;

/// Maximum chunks issued but not yet applied.
pub const DEFAULT_PENDING_CONN: usize = 10;

/// Maximum chunk requests on the wire at once.
pub const DEFAULT_BLOCK_REQ_TASKS: usize = 5;

/// Bound on every peer request.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Retries of one chunk before the run is abandoned.
pub const DEFAULT_BLOCK_FETCH_RETRY: usize = 3;

/// Consecutive local hashes offered to the peer in one ancestor request.
pub const DEFAULT_LIGHT_SCAN_SIZE: usize = 10;

/// Hash batches buffered between the hash fetcher and the block fetcher.
pub const HASH_BATCH_QUEUE_SIZE: usize = 4;

/// Capacity of the sync event broadcast channel.
pub const SYNC_EVENT_CAPACITY: usize = 64;

/// Recently seen block hashes remembered by the sync manager.
pub const DEFAULT_BLOCK_CACHE_SIZE: NonZeroUsize = nonzero!(300_usize);

/// Recently seen transaction hashes remembered by the sync manager.
pub const DEFAULT_TX_CACHE_SIZE: NonZeroUsize = nonzero!(50_000_usize);

#[derive(Debug, Clone)]
pub struct SyncerConfig {
    pub max_hash_req_size: u64,
    pub max_block_req_size: u64,
    pub max_pending_conn: usize,
    pub max_block_req_tasks: usize,
    pub fetch_timeout: Duration,
    pub max_block_fetch_retry: usize,
    pub light_scan_size: usize,
    /// Skip the single-round-trip ancestor request and always binary search.
    pub use_full_scan_only: bool,
}

impl Default for SyncerConfig {
    fn default() -> Self {
        Self {
            max_hash_req_size: DEFAULT_HASH_REQ_SIZE,
            max_block_req_size: DEFAULT_BLOCK_REQ_SIZE,
            max_pending_conn: DEFAULT_PENDING_CONN,
            max_block_req_tasks: DEFAULT_BLOCK_REQ_TASKS,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            max_block_fetch_retry: DEFAULT_BLOCK_FETCH_RETRY,
            light_scan_size: DEFAULT_LIGHT_SCAN_SIZE,
            use_full_scan_only: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncManagerConfig {
    pub block_cache_size: NonZeroUsize,
    pub tx_cache_size: NonZeroUsize,
    /// Bound on resolving the stop block before a run starts.
    pub fetch_timeout: Duration,
    pub locator_size: usize,
}

impl Default for SyncManagerConfig {
    fn default() -> Self {
        Self {
            block_cache_size: DEFAULT_BLOCK_CACHE_SIZE,
            tx_cache_size: DEFAULT_TX_CACHE_SIZE,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            locator_size: DEFAULT_LIGHT_SCAN_SIZE,
        }
    }
}
