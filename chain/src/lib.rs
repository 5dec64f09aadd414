//! Chain access used by the sync engine.
//!
//! The persistent storage engine lives elsewhere; sync only needs to read the
//! main chain by hash or height and to append blocks. [`MemoryChain`] is the
//! in-process implementation used by the demo node and the tests.

pub mod error;
pub mod memory;

pub use error::ChainError;
pub use memory::{MemoryChain, child_block};

use containers::{Block, BlockInfo, BlockNo, Bytes32};

pub trait ChainAccessor: Send + Sync + 'static {
    fn get_best_block(&self) -> Result<Block, ChainError>;

    /// Look up a main-chain block by hash.
    fn get_block(&self, hash: &Bytes32) -> Result<Block, ChainError>;

    fn get_block_by_number(&self, no: BlockNo) -> Result<Block, ChainError>;

    /// Append a block. The parent must be on the main chain.
    fn add_block(&self, block: Block) -> Result<(), ChainError>;
}

/// The latest `count` consecutive main-chain blocks, best first.
///
/// Used as the light-scan candidate list when looking for a common ancestor:
/// because the entries are consecutive, the highest one a peer recognises is
/// exactly the highest shared block within the window.
pub fn block_locator<C: ChainAccessor + ?Sized>(
    chain: &C,
    count: usize,
) -> Result<Vec<BlockInfo>, ChainError> {
    let best = chain.get_best_block()?;
    let best_no = best.block_no();
    let mut locator = Vec::with_capacity(count);
    locator.push(best.info());

    let lowest = best_no.saturating_sub(count.saturating_sub(1) as BlockNo);
    for no in (lowest..best_no).rev() {
        locator.push(chain.get_block_by_number(no)?.info());
    }

    locator.truncate(count.max(1));
    Ok(locator)
}
