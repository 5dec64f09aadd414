pub mod block;
pub mod types;

pub use block::{Block, BlockBody, BlockHeader, BlockInfo};
pub use ethereum_types::H256;
pub use types::{BlockNo, Bytes32, TxHash};
