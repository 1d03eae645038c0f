//! Validators and the deterministic proposer rotation.

use crate::block::{BlockId, Commit};
use crate::crypto::{Address, PublicKey};
use crate::hash::{merkle_root, Hash};
use crate::signing::vote_sign_bytes;
use crate::vote::VoteType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One validator: identity plus stake-weighted voting power.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub address: Address,
    pub pub_key: PublicKey,
    pub voting_power: u64,
    /// Proposer-rotation accumulator. Not part of the validator's identity;
    /// excluded from the set hash.
    pub accum: i64,
}

impl Validator {
    pub fn new(pub_key: PublicKey, voting_power: u64) -> Self {
        Validator {
            address: pub_key.address(),
            pub_key,
            voting_power,
            accum: 0,
        }
    }
}

/// A change to the validator set returned by the application's `end_block`.
/// Power 0 removes the validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorUpdate {
    pub pub_key: PublicKey,
    pub power: u64,
}

/// Errors from commit verification.
#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    #[error("commit has {got} precommits, validator set has {expected}")]
    WrongSize { expected: usize, got: usize },
    #[error("commit is for height {got}, expected {expected}")]
    WrongHeight { expected: u64, got: u64 },
    #[error("commit is for a different block")]
    WrongBlockId,
    #[error("invalid precommit signature from validator {0}")]
    InvalidSignature(u32),
    #[error("precommit from validator {index} has wrong round {round}")]
    WrongRound { index: u32, round: u32 },
    #[error("insufficient voting power: {got} of {total} (needs > 2/3)")]
    InsufficientPower { got: u64, total: u64 },
}

/// The active validator set, ordered by address.
///
/// The proposer for a round is the validator with the highest accumulator.
/// [`ValidatorSet::increment_accum`] advances the rotation: each step adds
/// every validator's voting power to its accumulator, then charges the chosen
/// proposer the total power. Over time each validator proposes in proportion
/// to its stake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
}

impl ValidatorSet {
    /// Build a set from validators, sorted by address. Accumulators start at
    /// zero, so the first proposer is chosen on the first `increment_accum`.
    pub fn new(mut validators: Vec<Validator>) -> Self {
        validators.sort_by(|a, b| a.address.cmp(&b.address));
        let mut set = ValidatorSet { validators };
        if !set.validators.is_empty() {
            set.increment_accum(1);
        }
        set
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    pub fn total_voting_power(&self) -> u64 {
        self.validators.iter().map(|v| v.voting_power).sum()
    }

    pub fn has_address(&self, address: &Address) -> bool {
        self.index_of(address).is_some()
    }

    pub fn index_of(&self, address: &Address) -> Option<u32> {
        self.validators
            .binary_search_by(|v| v.address.cmp(address))
            .ok()
            .map(|i| i as u32)
    }

    pub fn get_by_index(&self, index: u32) -> Option<&Validator> {
        self.validators.get(index as usize)
    }

    pub fn get_by_address(&self, address: &Address) -> Option<(u32, &Validator)> {
        self.index_of(address)
            .map(|i| (i, &self.validators[i as usize]))
    }

    /// The current proposer: highest accumulator, ties broken by address.
    pub fn proposer(&self) -> &Validator {
        self.validators
            .iter()
            .max_by(|a, b| {
                a.accum
                    .cmp(&b.accum)
                    .then_with(|| b.address.cmp(&a.address))
            })
            .expect("proposer() on empty validator set")
    }

    /// Advance the proposer rotation by `times` rounds.
    pub fn increment_accum(&mut self, times: u32) {
        let total = self.total_voting_power() as i64;
        for _ in 0..times {
            for v in &mut self.validators {
                v.accum += v.voting_power as i64;
            }
            let proposer_index = self
                .validators
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| {
                    a.accum
                        .cmp(&b.accum)
                        .then_with(|| b.address.cmp(&a.address))
                })
                .map(|(i, _)| i)
                .expect("increment_accum on empty validator set");
            self.validators[proposer_index].accum -= total;
        }
    }

    /// Apply updates from the application: power changes, additions, and
    /// removals (power 0). New validators enter with a zeroed accumulator.
    pub fn apply_updates(&mut self, updates: &[ValidatorUpdate]) {
        for update in updates {
            let address = update.pub_key.address();
            match self.index_of(&address) {
                Some(i) if update.power == 0 => {
                    self.validators.remove(i as usize);
                }
                Some(i) => {
                    self.validators[i as usize].voting_power = update.power;
                }
                None if update.power > 0 => {
                    let v = Validator::new(update.pub_key, update.power);
                    let pos = self
                        .validators
                        .binary_search_by(|x| x.address.cmp(&v.address))
                        .unwrap_err();
                    self.validators.insert(pos, v);
                }
                None => {}
            }
        }
    }

    /// Hash over (address, pubkey, power) of every validator, in order.
    pub fn hash(&self) -> Hash {
        let leaves: Vec<Hash> = self
            .validators
            .iter()
            .map(|v| {
                let bytes = bincode::serialize(&(v.address, v.pub_key, v.voting_power))
                    .expect("validator encoding must succeed - this is a bug if it fails");
                Hash::from_bytes(&bytes)
            })
            .collect();
        merkle_root(&leaves)
    }

    /// Verify that `commit` commits `block_id` at `height` with more than
    /// two-thirds of this set's voting power.
    pub fn verify_commit(
        &self,
        chain_id: &str,
        block_id: BlockId,
        height: u64,
        commit: &Commit,
    ) -> Result<(), CommitError> {
        if commit.precommits.len() != self.validators.len() {
            return Err(CommitError::WrongSize {
                expected: self.validators.len(),
                got: commit.precommits.len(),
            });
        }
        if commit.height() != height {
            return Err(CommitError::WrongHeight {
                expected: height,
                got: commit.height(),
            });
        }
        if commit.block_id != block_id {
            return Err(CommitError::WrongBlockId);
        }

        let round = commit.round();
        let mut tallied: u64 = 0;
        for (index, maybe_vote) in commit.precommits.iter().enumerate() {
            let Some(vote) = maybe_vote else { continue };
            let index = index as u32;
            if vote.round != round {
                return Err(CommitError::WrongRound {
                    index,
                    round: vote.round,
                });
            }
            let validator = &self.validators[index as usize];
            let sign_bytes = vote_sign_bytes(chain_id, vote);
            if !validator.pub_key.verify(&sign_bytes, &vote.signature) {
                return Err(CommitError::InvalidSignature(index));
            }
            debug_assert_eq!(vote.vote_type, VoteType::Precommit);
            // Only precommits for the committed block count toward the 2/3.
            if vote.block_id == Some(block_id) {
                tallied += validator.voting_power;
            }
        }

        let total = self.total_voting_power();
        if tallied * 3 <= total * 2 {
            return Err(CommitError::InsufficientPower {
                got: tallied,
                total,
            });
        }
        Ok(())
    }
}

impl fmt::Display for ValidatorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ValidatorSet{{n={} power={}}}",
            self.len(),
            self.total_voting_power()
        )
    }
}
