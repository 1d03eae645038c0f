//! Round steps and timeout descriptors.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// The steps of one consensus round, in order. The numeric values matter:
/// timeouts and the double-signing guard compare (height, round, step)
/// triples lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RoundStep {
    /// Waiting out `timeout_commit` before round 0 of the next height.
    /// Doubles as the commit-wait step.
    NewHeight = 1,
    /// Setting up a new round, about to propose.
    NewRound = 2,
    /// Proposal sent or awaited; gossiping the proposal.
    Propose = 3,
    /// Prevote cast; gossiping prevotes.
    Prevote = 4,
    /// Saw 2/3-any prevotes; waiting for stragglers.
    PrevoteWait = 5,
    /// Precommit cast; gossiping precommits.
    Precommit = 6,
    /// Saw 2/3-any precommits; waiting for stragglers.
    PrecommitWait = 7,
    /// Saw a 2/3-one precommit majority; assembling and finalizing the block.
    Commit = 8,
}

impl fmt::Display for RoundStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoundStep::NewHeight => "NewHeight",
            RoundStep::NewRound => "NewRound",
            RoundStep::Propose => "Propose",
            RoundStep::Prevote => "Prevote",
            RoundStep::PrevoteWait => "PrevoteWait",
            RoundStep::Precommit => "Precommit",
            RoundStep::PrecommitWait => "PrecommitWait",
            RoundStep::Commit => "Commit",
        };
        write!(f, "{}", name)
    }
}

/// A scheduled or fired timeout, tagged with the (height, round, step) it was
/// scheduled for. The scheduler drops requests older than its current tag and
/// never fires a stale timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutInfo {
    pub duration: Duration,
    pub height: u64,
    pub round: u32,
    pub step: RoundStep,
}

impl TimeoutInfo {
    /// True if `self` is for a strictly newer (height, round, step) than
    /// `other`, i.e. this request supersedes it.
    pub fn supersedes(&self, other: &TimeoutInfo) -> bool {
        (self.height, self.round, self.step) > (other.height, other.round, other.step)
    }
}

impl fmt::Display for TimeoutInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} ; {}/{} {}",
            self.duration, self.height, self.round, self.step
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_are_ordered() {
        assert!(RoundStep::NewHeight < RoundStep::NewRound);
        assert!(RoundStep::Propose < RoundStep::Prevote);
        assert!(RoundStep::PrecommitWait < RoundStep::Commit);
    }

    #[test]
    fn supersedes_is_lexicographic_on_hrs() {
        let base = TimeoutInfo {
            duration: Duration::ZERO,
            height: 5,
            round: 1,
            step: RoundStep::Prevote,
        };
        let newer_step = TimeoutInfo {
            step: RoundStep::PrevoteWait,
            ..base
        };
        let newer_round = TimeoutInfo { round: 2, ..base };
        let older_height = TimeoutInfo { height: 4, ..base };
        assert!(newer_step.supersedes(&base));
        assert!(newer_round.supersedes(&base));
        assert!(!older_height.supersedes(&base));
        assert!(!base.supersedes(&base));
    }
}
