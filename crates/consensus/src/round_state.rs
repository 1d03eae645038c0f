//! Mutable state of the consensus machine for the current height.

use crate::height_vote_set::HeightVoteSet;
use crate::vote_set::VoteSet;
use stanchion_core::RoundStep;
use stanchion_types::{Block, PartSet, Proposal, ValidatorSet};
use std::fmt;
use std::time::Duration;

/// Everything the state machine tracks for the height in progress.
///
/// Owned exclusively by the consensus event loop; anything handed out is a
/// read-only borrow or a copy.
pub struct RoundState {
    pub height: u64,
    pub round: u32,
    pub step: RoundStep,
    /// When round 0 of this height may start (commit time of the previous
    /// height plus the commit timeout).
    pub start_time: Duration,
    /// When 2/3 precommits for a block were first seen this height.
    /// `Duration::ZERO` until then.
    pub commit_time: Duration,
    pub validators: ValidatorSet,
    pub proposal: Option<Proposal>,
    pub proposal_block: Option<Block>,
    pub proposal_block_parts: Option<PartSet>,
    /// Round of the current lock; 0 means unlocked.
    pub locked_round: u32,
    pub locked_block: Option<Block>,
    pub locked_block_parts: Option<PartSet>,
    pub votes: HeightVoteSet,
    /// Round whose precommits reached a 2/3 block majority.
    pub commit_round: Option<u32>,
    /// Precommits that committed the previous height.
    pub last_commit: Option<VoteSet>,
    pub last_validators: ValidatorSet,
}

impl RoundState {
    /// The round the last commit happened at, in wire form (-1 when there is
    /// no last commit, i.e. at height 1).
    pub fn last_commit_round_i32(&self) -> i32 {
        self.last_commit
            .as_ref()
            .map(|vs| vs.round() as i32)
            .unwrap_or(-1)
    }

    pub fn is_locked(&self) -> bool {
        self.locked_block.is_some()
    }
}

impl fmt::Display for RoundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RoundState{{{}/{}/{} locked_round={} proposal={}}}",
            self.height,
            self.round,
            self.step,
            self.locked_round,
            self.proposal.is_some(),
        )
    }
}
