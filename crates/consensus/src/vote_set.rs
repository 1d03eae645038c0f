//! Vote accounting for one (height, round, type).

use stanchion_types::{
    vote_sign_bytes, BitArray, BlockId, Commit, DuplicateVoteEvidence, ValidatorSet, Vote,
    VoteType,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// A two-thirds majority: a specific block, or nil.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Maj23 {
    Block(BlockId),
    Nil,
}

impl Maj23 {
    pub fn block_id(&self) -> Option<BlockId> {
        match self {
            Maj23::Block(id) => Some(*id),
            Maj23::Nil => None,
        }
    }
}

/// Outcome of a successful [`VoteSet::add_vote`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddVoteOutcome {
    /// First vote from this validator for this (height, round, type).
    Added,
    /// Identical vote already present.
    Duplicate,
}

/// Errors from [`VoteSet::add_vote`].
#[derive(Debug, thiserror::Error)]
pub enum VoteSetError {
    #[error("vote height {got} does not match vote set height {expected}")]
    WrongHeight { expected: u64, got: u64 },
    #[error("vote round {got} does not match vote set round {expected}")]
    WrongRound { expected: u32, got: u32 },
    #[error("vote type {got} does not match vote set type {expected}")]
    WrongType { expected: VoteType, got: VoteType },
    #[error("validator index {0} out of range")]
    InvalidIndex(u32),
    #[error("vote address does not match validator at index {0}")]
    AddressMismatch(u32),
    #[error("invalid vote signature from validator {0}")]
    InvalidSignature(u32),
    #[error("conflicting signature from validator {}", .0.address())]
    Conflicting(Box<DuplicateVoteEvidence>),
}

/// Votes of one type for one (height, round), indexed by validator.
///
/// Tracks per-BlockId voting power and the two thresholds that drive the
/// state machine: 2/3-any (combined power across all blocks including nil)
/// and 2/3-one (a single block id). Both are strict `> 2/3` of total power.
///
/// A validator contributes at most one vote. A second, conflicting vote is
/// remembered as slashing evidence but never tallied.
pub struct VoteSet {
    chain_id: String,
    height: u64,
    round: u32,
    vote_type: VoteType,
    validators: Arc<ValidatorSet>,
    votes: Vec<Option<Vote>>,
    votes_bit_array: BitArray,
    /// Power per voted block id (`None` = nil votes).
    by_block: HashMap<Option<BlockId>, u64>,
    /// Total power that has voted for anything.
    sum: u64,
    /// Latched once some block id (or nil) crosses 2/3: never cleared for
    /// this round.
    maj23: Option<Maj23>,
    /// Conflicting vote pairs seen from Byzantine validators.
    conflicts: Vec<DuplicateVoteEvidence>,
}

impl VoteSet {
    pub fn new(
        chain_id: impl Into<String>,
        height: u64,
        round: u32,
        vote_type: VoteType,
        validators: Arc<ValidatorSet>,
    ) -> Self {
        let n = validators.len();
        VoteSet {
            chain_id: chain_id.into(),
            height,
            round,
            vote_type,
            validators,
            votes: vec![None; n],
            votes_bit_array: BitArray::new(n),
            by_block: HashMap::new(),
            sum: 0,
            maj23: None,
            conflicts: Vec::new(),
        }
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn vote_type(&self) -> VoteType {
        self.vote_type
    }

    pub fn size(&self) -> usize {
        self.validators.len()
    }

    /// Validate and add a vote.
    pub fn add_vote(&mut self, vote: &Vote) -> Result<AddVoteOutcome, VoteSetError> {
        if vote.height != self.height {
            return Err(VoteSetError::WrongHeight {
                expected: self.height,
                got: vote.height,
            });
        }
        if vote.round != self.round {
            return Err(VoteSetError::WrongRound {
                expected: self.round,
                got: vote.round,
            });
        }
        if vote.vote_type != self.vote_type {
            return Err(VoteSetError::WrongType {
                expected: self.vote_type,
                got: vote.vote_type,
            });
        }

        let index = vote.validator_index;
        let Some(validator) = self.validators.get_by_index(index) else {
            return Err(VoteSetError::InvalidIndex(index));
        };
        if validator.address != vote.validator_address {
            return Err(VoteSetError::AddressMismatch(index));
        }

        let sign_bytes = vote_sign_bytes(&self.chain_id, vote);
        if !validator.pub_key.verify(&sign_bytes, &vote.signature) {
            return Err(VoteSetError::InvalidSignature(index));
        }

        if let Some(existing) = &self.votes[index as usize] {
            if existing.block_id == vote.block_id && existing.timestamp == vote.timestamp {
                return Ok(AddVoteOutcome::Duplicate);
            }
            // Same validator, same (height, round, type), different payload:
            // Byzantine. Remember the pair for slashing, keep the tally as is.
            let evidence = DuplicateVoteEvidence {
                vote_a: existing.clone(),
                vote_b: vote.clone(),
            };
            warn!(
                validator = %vote.validator_address,
                height = vote.height,
                round = vote.round,
                "Conflicting vote signature"
            );
            self.conflicts.push(evidence.clone());
            return Err(VoteSetError::Conflicting(Box::new(evidence)));
        }

        let power = validator.voting_power;
        self.votes[index as usize] = Some(vote.clone());
        self.votes_bit_array.set(index as usize, true);
        self.sum += power;
        let tally = self.by_block.entry(vote.block_id).or_insert(0);
        *tally += power;

        if self.maj23.is_none() && *tally * 3 > self.total_power() * 2 {
            self.maj23 = Some(match vote.block_id {
                Some(id) => Maj23::Block(id),
                None => Maj23::Nil,
            });
        }
        Ok(AddVoteOutcome::Added)
    }

    fn total_power(&self) -> u64 {
        self.validators.total_voting_power()
    }

    /// Combined power across all block ids (nil included) exceeds 2/3.
    pub fn has_two_thirds_any(&self) -> bool {
        self.sum * 3 > self.total_power() * 2
    }

    /// Some single block id (or nil) exceeds 2/3.
    pub fn has_two_thirds_majority(&self) -> bool {
        self.maj23.is_some()
    }

    /// Every validator has voted.
    pub fn has_all(&self) -> bool {
        self.sum == self.total_power()
    }

    pub fn two_thirds_majority(&self) -> Option<Maj23> {
        self.maj23
    }

    pub fn get_by_index(&self, index: u32) -> Option<&Vote> {
        self.votes.get(index as usize).and_then(|v| v.as_ref())
    }

    pub fn bit_array(&self) -> BitArray {
        self.votes_bit_array.clone()
    }

    /// Evidence pairs collected so far.
    pub fn conflicts(&self) -> &[DuplicateVoteEvidence] {
        &self.conflicts
    }

    /// Build the commit proving the 2/3 majority for a block.
    ///
    /// Only callable on a precommit set whose majority is a real block.
    /// Votes for anything else are left out (`None`).
    pub fn make_commit(&self) -> Commit {
        assert_eq!(
            self.vote_type,
            VoteType::Precommit,
            "make_commit on a prevote set"
        );
        let Some(Maj23::Block(block_id)) = self.maj23 else {
            panic!("make_commit without a 2/3 majority for a block");
        };
        let precommits = self
            .votes
            .iter()
            .map(|v| match v {
                Some(vote) if vote.block_id == Some(block_id) => Some(vote.clone()),
                _ => None,
            })
            .collect();
        Commit {
            block_id,
            precommits,
        }
    }
}

impl fmt::Debug for VoteSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VoteSet{{{}/{} {} {}/{} {}}}",
            self.height,
            self.round,
            self.vote_type,
            self.sum,
            self.total_power(),
            self.votes_bit_array
        )
    }
}
