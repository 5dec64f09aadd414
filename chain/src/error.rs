use containers::{BlockNo, Bytes32};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("block {0} not found")]
    BlockNotFound(Bytes32),

    #[error("no block at height {0}")]
    BlockNoNotFound(BlockNo),

    #[error("block {no} ({hash}) already exists")]
    AlreadyExists { no: BlockNo, hash: Bytes32 },

    #[error("parent {parent} of block {no} is unknown")]
    UnknownParent { no: BlockNo, parent: Bytes32 },

    #[error("genesis block cannot be added")]
    GenesisAdd,
}
