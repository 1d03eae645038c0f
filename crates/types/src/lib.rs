//! Core types for stanchion consensus.
//!
//! This crate provides the foundational types used throughout the consensus
//! implementation:
//!
//! - **Primitives**: [`Hash`], Ed25519 keys and signatures
//! - **Consensus types**: [`Block`], [`Vote`], [`Proposal`], [`PartSet`]
//! - **Validators**: [`ValidatorSet`] with the accum-based proposer rotation
//! - **Canonical signing**: deterministic sign-bytes for votes and proposals
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend
//! on any other workspace crates, making it the foundation layer.

mod block;
mod crypto;
mod hash;
mod params;
mod part_set;
mod proposal;
mod signing;
mod validator;
mod vote;

pub use block::{Block, BlockError, BlockId, Commit, Header, Tx};
pub use crypto::{Address, KeyPair, PublicKey, Signature};
pub use hash::{merkle_root, Hash, HexError, MerkleProof};
pub use params::{ConsensusParams, ConsensusParamsUpdate};
pub use part_set::{BitArray, Part, PartSet, PartSetError, PartSetHeader, DEFAULT_PART_SIZE};
pub use proposal::Proposal;
pub use signing::{heartbeat_sign_bytes, proposal_sign_bytes, vote_sign_bytes};
pub use validator::{CommitError, Validator, ValidatorSet, ValidatorUpdate};
pub use vote::{DuplicateVoteEvidence, Vote, VoteType};

use serde::{Deserialize, Serialize};

/// Proposer liveness heartbeat, gossiped while a proposal is being built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub validator_address: Address,
    pub validator_index: u32,
    pub height: u64,
    pub round: u32,
    pub sequence: u64,
    pub signature: Signature,
}

/// Test utilities.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    use super::*;

    /// Deterministic keypair from a seed byte.
    pub fn test_keypair(seed: u8) -> KeyPair {
        KeyPair::from_seed(&[seed.wrapping_add(1); 32])
    }

    /// A validator set of `n` validators with the given uniform power, keyed
    /// by seeds `0..n`. Returns the set and the matching keypairs, ordered by
    /// the set's validator order.
    pub fn test_validator_set(n: usize, power: u64) -> (ValidatorSet, Vec<KeyPair>) {
        let keys: Vec<KeyPair> = (0..n).map(|i| test_keypair(i as u8)).collect();
        let validators = keys
            .iter()
            .map(|k| Validator::new(k.public_key(), power))
            .collect();
        let set = ValidatorSet::new(validators);
        // Reorder keys to match the address-sorted set.
        let mut ordered = Vec::with_capacity(n);
        for v in set.validators() {
            let key = keys
                .iter()
                .find(|k| k.address() == v.address)
                .expect("key for validator")
                .clone();
            ordered.push(key);
        }
        (set, ordered)
    }

    /// Build and sign a vote for the given validator index.
    #[allow(clippy::too_many_arguments)]
    pub fn signed_vote(
        chain_id: &str,
        key: &KeyPair,
        index: u32,
        height: u64,
        round: u32,
        vote_type: VoteType,
        block_id: Option<BlockId>,
        timestamp: u64,
    ) -> Vote {
        let mut vote = Vote {
            height,
            round,
            vote_type,
            block_id,
            validator_address: key.address(),
            validator_index: index,
            timestamp,
            signature: Signature::zero(),
        };
        vote.signature = key.sign(&vote_sign_bytes(chain_id, &vote));
        vote
    }
}
