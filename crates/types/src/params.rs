//! Consensus parameters agreed on-chain.

use crate::hash::Hash;
use crate::part_set::DEFAULT_PART_SIZE;
use serde::{Deserialize, Serialize};

/// Parameters every validator must agree on. Changes returned by the
/// application's `end_block` take effect two heights later, like validator
/// set changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusParams {
    /// Maximum serialized block size in bytes.
    pub max_block_size_bytes: usize,
    /// Maximum number of transactions per block.
    pub max_block_txs: usize,
    /// Size of a block gossip part in bytes.
    pub block_part_size_bytes: usize,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        ConsensusParams {
            max_block_size_bytes: 22_020_096, // 21 MiB
            max_block_txs: 10_000,
            block_part_size_bytes: DEFAULT_PART_SIZE,
        }
    }
}

impl ConsensusParams {
    pub fn hash(&self) -> Hash {
        let bytes = bincode::serialize(self)
            .expect("params encoding must succeed - this is a bug if it fails");
        Hash::from_bytes(&bytes)
    }
}

/// A partial update to the consensus parameters; `None` fields are unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusParamsUpdate {
    pub max_block_size_bytes: Option<usize>,
    pub max_block_txs: Option<usize>,
    pub block_part_size_bytes: Option<usize>,
}

impl ConsensusParams {
    pub fn apply_update(&self, update: &ConsensusParamsUpdate) -> ConsensusParams {
        ConsensusParams {
            max_block_size_bytes: update
                .max_block_size_bytes
                .unwrap_or(self.max_block_size_bytes),
            max_block_txs: update.max_block_txs.unwrap_or(self.max_block_txs),
            block_part_size_bytes: update
                .block_part_size_bytes
                .unwrap_or(self.block_part_size_bytes),
        }
    }
}
