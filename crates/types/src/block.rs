//! Blocks, headers, and commits.

use crate::hash::{merkle_root, Hash};
use crate::crypto::Address;
use crate::part_set::{PartSet, PartSetHeader};
use crate::vote::{Vote, VoteType};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An opaque transaction. Consensus orders transactions; the application
/// interprets them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tx(pub Vec<u8>);

impl Tx {
    pub fn hash(&self) -> Hash {
        Hash::from_bytes(&self.0)
    }
}

/// Identifies a block: its header hash plus the header of its part set.
///
/// Both are needed because a Byzantine proposer could gossip the same block
/// under two different part sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockId {
    pub hash: Hash,
    pub parts: PartSetHeader,
}

impl BlockId {
    pub fn zero() -> Self {
        BlockId {
            hash: Hash::ZERO,
            parts: PartSetHeader::zero(),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.hash.is_zero() && self.parts.is_zero()
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@{}", self.hash, self.parts)
    }
}

/// Block header. The block hash is the SHA-256 of this structure's canonical
/// encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub chain_id: String,
    pub height: u64,
    /// Proposer's wall clock at proposal time, milliseconds since epoch.
    pub time: u64,
    pub num_txs: u64,
    /// BlockId of the committed block at height-1; zero at height 1.
    pub last_block_id: BlockId,
    /// Hash of this block's `last_commit`.
    pub last_commit_hash: Hash,
    /// Merkle root of the transaction hashes.
    pub data_hash: Hash,
    /// Hash of the validator set authorized to commit this block.
    pub validators_hash: Hash,
    /// Hash of the consensus parameters in effect at this height.
    pub consensus_hash: Hash,
    /// Application state hash after executing the block at height-1.
    pub app_hash: Hash,
    /// Root of the deliver-tx results from height-1.
    pub results_hash: Hash,
    pub proposer_address: Address,
}

impl Header {
    pub fn hash(&self) -> Hash {
        let bytes =
            bincode::serialize(self).expect("header encoding must succeed - this is a bug if it fails");
        Hash::from_bytes(&bytes)
    }
}

/// The precommits that committed the block at height-1, ordered by validator
/// index. `None` entries are validators whose precommit was not seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub block_id: BlockId,
    pub precommits: Vec<Option<Vote>>,
}

impl Commit {
    /// The empty commit preceding height 1.
    pub fn empty() -> Self {
        Commit {
            block_id: BlockId::zero(),
            precommits: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.precommits.is_empty()
    }

    /// Height of the committed block, taken from the first present precommit.
    pub fn height(&self) -> u64 {
        self.first_precommit().map(|v| v.height).unwrap_or(0)
    }

    /// Round at which the block was committed.
    pub fn round(&self) -> u32 {
        self.first_precommit().map(|v| v.round).unwrap_or(0)
    }

    fn first_precommit(&self) -> Option<&Vote> {
        self.precommits.iter().flatten().next()
    }

    /// Number of present precommits.
    pub fn num_present(&self) -> usize {
        self.precommits.iter().flatten().count()
    }

    /// Validator indices with no precommit in this commit.
    pub fn absent_indices(&self) -> Vec<u32> {
        self.precommits
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_none())
            .map(|(i, _)| i as u32)
            .collect()
    }

    pub fn hash(&self) -> Hash {
        let leaves: Vec<Hash> = self
            .precommits
            .iter()
            .map(|p| match p {
                Some(vote) => Hash::from_bytes(
                    &bincode::serialize(vote)
                        .expect("vote encoding must succeed - this is a bug if it fails"),
                ),
                None => Hash::ZERO,
            })
            .collect();
        merkle_root(&leaves)
    }

    /// Structural checks: every present precommit is a precommit for the
    /// commit's height/round and block id (or nil, for validators that
    /// precommitted nil in the commit round).
    pub fn validate_basic(&self) -> Result<(), BlockError> {
        if self.is_empty() {
            return Ok(());
        }
        let height = self.height();
        let round = self.round();
        for vote in self.precommits.iter().flatten() {
            if vote.vote_type != VoteType::Precommit {
                return Err(BlockError::InvalidCommit("non-precommit vote in commit".into()));
            }
            if vote.height != height || vote.round != round {
                return Err(BlockError::InvalidCommit(format!(
                    "commit vote at {}/{} does not match commit {}/{}",
                    vote.height, vote.round, height, round
                )));
            }
            if let Some(block_id) = vote.block_id {
                if block_id != self.block_id {
                    return Err(BlockError::InvalidCommit(
                        "commit vote for a different block".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Errors from structural block validation.
#[derive(Debug, thiserror::Error)]
pub enum BlockError {
    #[error("wrong chain id: expected {expected}, got {got}")]
    WrongChainId { expected: String, got: String },
    #[error("wrong height: expected {expected}, got {got}")]
    WrongHeight { expected: u64, got: u64 },
    #[error("wrong last block id")]
    WrongLastBlockId,
    #[error("data hash mismatch")]
    DataHashMismatch,
    #[error("last commit hash mismatch")]
    LastCommitHashMismatch,
    #[error("invalid commit: {0}")]
    InvalidCommit(String),
    #[error("block decode failed: {0}")]
    Decode(String),
}

/// A complete block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: Header,
    pub data: Vec<Tx>,
    pub last_commit: Commit,
}

impl Block {
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    /// Merkle root of the block's transaction hashes.
    pub fn data_hash(&self) -> Hash {
        let leaves: Vec<Hash> = self.data.iter().map(|tx| tx.hash()).collect();
        merkle_root(&leaves)
    }

    /// Structural validation against the previous block.
    pub fn validate_basic(
        &self,
        chain_id: &str,
        last_height: u64,
        last_block_id: BlockId,
    ) -> Result<(), BlockError> {
        if self.header.chain_id != chain_id {
            return Err(BlockError::WrongChainId {
                expected: chain_id.to_string(),
                got: self.header.chain_id.clone(),
            });
        }
        if self.header.height != last_height + 1 {
            return Err(BlockError::WrongHeight {
                expected: last_height + 1,
                got: self.header.height,
            });
        }
        if self.header.last_block_id != last_block_id {
            return Err(BlockError::WrongLastBlockId);
        }
        if self.header.num_txs != self.data.len() as u64 {
            return Err(BlockError::DataHashMismatch);
        }
        if self.header.data_hash != self.data_hash() {
            return Err(BlockError::DataHashMismatch);
        }
        if self.header.last_commit_hash != self.last_commit.hash() {
            return Err(BlockError::LastCommitHashMismatch);
        }
        if self.header.height == 1 {
            if !self.last_commit.is_empty() {
                return Err(BlockError::InvalidCommit(
                    "first block must carry an empty last commit".into(),
                ));
            }
        } else if self.last_commit.is_empty() {
            return Err(BlockError::InvalidCommit("missing last commit".into()));
        }
        self.last_commit.validate_basic()
    }

    /// Serialize and split into gossip parts.
    pub fn make_part_set(&self, part_size: usize) -> PartSet {
        let bytes =
            bincode::serialize(self).expect("block encoding must succeed - this is a bug if it fails");
        PartSet::from_data(&bytes, part_size)
    }

    /// Decode a block from reassembled part bytes.
    pub fn from_part_set_bytes(bytes: &[u8]) -> Result<Block, BlockError> {
        bincode::deserialize(bytes).map_err(|e| BlockError::Decode(e.to_string()))
    }

    /// The BlockId naming this block under the given part set.
    pub fn block_id(&self, parts: &PartSet) -> BlockId {
        BlockId {
            hash: self.hash(),
            parts: parts.header(),
        }
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block{{h={} txs={} hash={:?}}}",
            self.header.height,
            self.data.len(),
            self.hash()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part_set::DEFAULT_PART_SIZE;

    fn test_header(height: u64) -> Header {
        Header {
            chain_id: "test-chain".into(),
            height,
            time: 1000,
            num_txs: 0,
            last_block_id: BlockId::zero(),
            last_commit_hash: Commit::empty().hash(),
            data_hash: merkle_root(&[]),
            validators_hash: Hash::ZERO,
            consensus_hash: Hash::ZERO,
            app_hash: Hash::ZERO,
            results_hash: Hash::ZERO,
            proposer_address: Address::from_raw([0u8; 20]),
        }
    }

    #[test]
    fn header_hash_is_deterministic() {
        let h = test_header(1);
        assert_eq!(h.hash(), h.hash());
        let mut h2 = h.clone();
        h2.height = 2;
        assert_ne!(h.hash(), h2.hash());
    }

    #[test]
    fn block_part_set_roundtrip() {
        let block = Block {
            header: test_header(1),
            data: vec![Tx(vec![1, 2, 3]), Tx(vec![4, 5])],
            last_commit: Commit::empty(),
        };
        let parts = block.make_part_set(DEFAULT_PART_SIZE);
        let bytes = parts.assemble().unwrap();
        let decoded = Block::from_part_set_bytes(&bytes).unwrap();
        assert_eq!(decoded, block);
    }

    #[test]
    fn first_block_accepts_empty_last_commit() {
        let mut block = Block {
            header: test_header(1),
            data: vec![],
            last_commit: Commit::empty(),
        };
        block.header.data_hash = block.data_hash();
        block
            .validate_basic("test-chain", 0, BlockId::zero())
            .unwrap();
    }

    #[test]
    fn wrong_height_rejected() {
        let mut block = Block {
            header: test_header(5),
            data: vec![],
            last_commit: Commit::empty(),
        };
        block.header.data_hash = block.data_hash();
        assert!(matches!(
            block.validate_basic("test-chain", 0, BlockId::zero()),
            Err(BlockError::WrongHeight { .. })
        ));
    }
}
