use std::collections::HashMap;

use containers::{Block, BlockNo, Bytes32};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::{ChainAccessor, ChainError};

/// In-memory main chain.
///
/// Stores only the main chain. A block whose parent is on the main chain
/// below the tip replaces everything above that parent, which is enough to
/// switch to a peer's branch once the common ancestor is known.
#[derive(Debug)]
pub struct MemoryChain {
    inner: RwLock<Inner>,
}

#[derive(Debug, Clone)]
struct Inner {
    blocks: Vec<Block>,
    index: HashMap<Bytes32, BlockNo>,
}

impl MemoryChain {
    pub fn new(genesis: Block) -> Self {
        let mut index = HashMap::new();
        index.insert(genesis.hash(), 0);

        Self {
            inner: RwLock::new(Inner {
                blocks: vec![genesis],
                index,
            }),
        }
    }

    /// Deterministic chain of `height` blocks on top of the default genesis.
    pub fn generate(height: BlockNo, seed: u64) -> Self {
        let chain = Self::new(Block::genesis(0));
        chain.extend(height, seed);
        chain
    }

    /// Copy of the first `at + 1` blocks, extended to `height` with blocks
    /// derived from `seed`. Different seeds give diverging branches.
    pub fn fork(&self, at: BlockNo, height: BlockNo, seed: u64) -> Self {
        let mut inner = self.inner.read().clone();
        let keep = (at as usize + 1).min(inner.blocks.len());
        for removed in inner.blocks.drain(keep..) {
            inner.index.remove(&removed.hash());
        }

        let chain = Self {
            inner: RwLock::new(inner),
        };
        chain.extend(height, seed);
        chain
    }

    /// Append generated blocks until the best height is `height`.
    pub fn extend(&self, height: BlockNo, seed: u64) {
        let mut inner = self.inner.write();
        while (inner.blocks.len() as BlockNo) <= height {
            let block = match inner.blocks.last() {
                Some(parent) => child_block(parent, seed),
                None => return,
            };
            inner.index.insert(block.hash(), block.block_no());
            inner.blocks.push(block);
        }
    }

    pub fn best_no(&self) -> BlockNo {
        self.inner.read().blocks.len() as BlockNo - 1
    }

    pub fn hash_at(&self, no: BlockNo) -> Option<Bytes32> {
        self.inner.read().blocks.get(no as usize).map(Block::hash)
    }

    /// Blocks in `[from, to]` that exist on the main chain.
    pub fn range(&self, from: BlockNo, to: BlockNo) -> Vec<Block> {
        let inner = self.inner.read();
        inner
            .blocks
            .iter()
            .skip(from as usize)
            .take_while(|block| block.block_no() <= to)
            .cloned()
            .collect()
    }
}

/// Deterministic child of `parent`; `seed` selects the branch.
pub fn child_block(parent: &Block, seed: u64) -> Block {
    let no = parent.block_no() + 1;
    let mut tx = [0u8; 32];
    tx[..8].copy_from_slice(&seed.to_le_bytes());
    tx[8..16].copy_from_slice(&no.to_le_bytes());

    Block::new(
        no,
        parent.hash(),
        parent.header.timestamp + 1,
        vec![Bytes32::from(tx)],
    )
}

impl ChainAccessor for MemoryChain {
    fn get_best_block(&self) -> Result<Block, ChainError> {
        let inner = self.inner.read();
        inner
            .blocks
            .last()
            .cloned()
            .ok_or(ChainError::BlockNoNotFound(0))
    }

    fn get_block(&self, hash: &Bytes32) -> Result<Block, ChainError> {
        let inner = self.inner.read();
        inner
            .index
            .get(hash)
            .and_then(|no| inner.blocks.get(*no as usize))
            .cloned()
            .ok_or(ChainError::BlockNotFound(*hash))
    }

    fn get_block_by_number(&self, no: BlockNo) -> Result<Block, ChainError> {
        self.inner
            .read()
            .blocks
            .get(no as usize)
            .cloned()
            .ok_or(ChainError::BlockNoNotFound(no))
    }

    fn add_block(&self, block: Block) -> Result<(), ChainError> {
        let no = block.block_no();
        let hash = block.hash();
        let parent = block.prev_block_hash();

        if no == 0 {
            return Err(ChainError::GenesisAdd);
        }

        let mut inner = self.inner.write();

        if inner.index.contains_key(&hash) {
            return Err(ChainError::AlreadyExists { no, hash });
        }

        match inner.blocks.get(no as usize - 1) {
            Some(expected) if expected.hash() == parent => {}
            _ => return Err(ChainError::UnknownParent { no, parent }),
        }

        let best_no = inner.blocks.len() as BlockNo - 1;
        if no <= best_no {
            let removed: Vec<Block> = inner.blocks.drain(no as usize..).collect();
            for block in &removed {
                inner.index.remove(&block.hash());
            }
            info!(
                from = no,
                old_best = best_no,
                removed = removed.len(),
                "Switched main chain branch"
            );
        }

        inner.index.insert(hash, no);
        inner.blocks.push(block);
        debug!(no, hash = %hash.short(), "Added block");

        Ok(())
    }
}
