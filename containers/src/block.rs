use crate::{BlockNo, Bytes32, TxHash};
use ethereum_types::H256;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// The body of a block. Only transaction hashes are carried; execution is
/// not this crate's concern.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlockBody {
    pub txs: Vec<TxHash>,
}

impl BlockBody {
    /// Commitment to the transaction list. An empty body commits to zero.
    pub fn tx_root(&self) -> Bytes32 {
        if self.txs.is_empty() {
            return Bytes32::zero();
        }

        let mut hasher = Sha256::new();
        for tx in &self.txs {
            hasher.update(tx.as_bytes());
        }
        Bytes32(H256::from_slice(&hasher.finalize()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    pub block_no: BlockNo,
    pub prev_block_hash: Bytes32,
    pub timestamp: u64,
    pub tx_root: Bytes32,
}

impl BlockHeader {
    pub fn hash(&self) -> Bytes32 {
        let mut hasher = Sha256::new();
        hasher.update(self.block_no.to_le_bytes());
        hasher.update(self.prev_block_hash.as_bytes());
        hasher.update(self.timestamp.to_le_bytes());
        hasher.update(self.tx_root.as_bytes());
        Bytes32(H256::from_slice(&hasher.finalize()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub body: BlockBody,
}

impl Block {
    pub fn new(
        block_no: BlockNo,
        prev_block_hash: Bytes32,
        timestamp: u64,
        txs: Vec<TxHash>,
    ) -> Self {
        let body = BlockBody { txs };
        let header = BlockHeader {
            block_no,
            prev_block_hash,
            timestamp,
            tx_root: body.tx_root(),
        };
        Self { header, body }
    }

    /// Genesis block. Chains built from different timestamps share nothing.
    pub fn genesis(timestamp: u64) -> Self {
        Self::new(0, Bytes32::zero(), timestamp, Vec::new())
    }

    pub fn hash(&self) -> Bytes32 {
        self.header.hash()
    }

    pub fn block_no(&self) -> BlockNo {
        self.header.block_no
    }

    pub fn prev_block_hash(&self) -> Bytes32 {
        self.header.prev_block_hash
    }

    pub fn is_genesis(&self) -> bool {
        self.header.block_no == 0
    }

    pub fn info(&self) -> BlockInfo {
        BlockInfo {
            hash: self.hash(),
            no: self.block_no(),
        }
    }
}

/// Reference to a block by hash and height.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockInfo {
    pub hash: Bytes32,
    pub no: BlockNo,
}

impl BlockInfo {
    pub fn new(hash: Bytes32, no: BlockNo) -> Self {
        Self { hash, no }
    }
}

impl fmt::Display for BlockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.no, self.hash.short())
    }
}
