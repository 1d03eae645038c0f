//! Votes and double-vote evidence.

use crate::block::BlockId;
use crate::crypto::{Address, Signature};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The two voting rounds of a consensus round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoteType {
    Prevote,
    Precommit,
}

impl VoteType {
    /// Numeric form used in canonical sign-bytes.
    pub fn as_byte(&self) -> u8 {
        match self {
            VoteType::Prevote => 1,
            VoteType::Precommit => 2,
        }
    }
}

impl fmt::Display for VoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteType::Prevote => write!(f, "prevote"),
            VoteType::Precommit => write!(f, "precommit"),
        }
    }
}

/// A prevote or precommit from one validator.
///
/// `block_id: None` is a nil vote: a vote for no block this round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub height: u64,
    pub round: u32,
    pub vote_type: VoteType,
    pub block_id: Option<BlockId>,
    pub validator_address: Address,
    pub validator_index: u32,
    /// Voter's wall clock, milliseconds since epoch. Recorded, not agreed on.
    pub timestamp: u64,
    pub signature: Signature,
}

impl Vote {
    pub fn is_nil(&self) -> bool {
        self.block_id.is_none()
    }
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Vote{{{}/{} {} val={} {}}}",
            self.height,
            self.round,
            self.vote_type,
            self.validator_index,
            match &self.block_id {
                Some(id) => format!("{}", id),
                None => "nil".to_string(),
            }
        )
    }
}

/// Two conflicting votes signed by the same validator at the same
/// height/round/type. Grounds for slashing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateVoteEvidence {
    pub vote_a: Vote,
    pub vote_b: Vote,
}

impl DuplicateVoteEvidence {
    pub fn address(&self) -> Address {
        self.vote_a.validator_address
    }

    pub fn height(&self) -> u64 {
        self.vote_a.height
    }
}

impl fmt::Display for DuplicateVoteEvidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DuplicateVoteEvidence{{val={} h={} r={} {}}}",
            self.address(),
            self.vote_a.height,
            self.vote_a.round,
            self.vote_a.vote_type,
        )
    }
}
