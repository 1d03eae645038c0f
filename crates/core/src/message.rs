//! Wire messages exchanged between consensus engines.
//!
//! The transport is out of scope; it delivers these messages
//! pre-authenticated and in per-peer order. Dispatch uses the serde enum tag.

use crate::step::RoundStep;
use serde::{Deserialize, Serialize};
use stanchion_types::{BitArray, Part, PartSetHeader, Proposal, Vote, VoteType};
use std::fmt;

/// Opaque identifier for the sending peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Messages that drive the consensus state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusMessage {
    /// A signed block proposal for (height, round).
    Proposal { proposal: Proposal },

    /// One part of the proposed block.
    BlockPart { height: u64, round: u32, part: Part },

    /// A prevote or precommit.
    Vote { validator_index: u32, vote: Vote },

    /// Hint that the sender holds the identified vote; used by gossip to
    /// avoid redundant sends.
    HasVote {
        height: u64,
        round: u32,
        vote_type: VoteType,
        index: u32,
    },

    /// Peer progress broadcast, sent on every step change.
    NewRoundStep {
        height: u64,
        round: u32,
        step: RoundStep,
        seconds_since_start_time: u64,
        last_commit_round: i32,
    },

    /// Sent while in the commit step, so lagging peers know which parts to
    /// request.
    CommitStep {
        height: u64,
        block_parts_header: PartSetHeader,
        block_parts: BitArray,
    },
}

impl ConsensusMessage {
    /// Message type name for logs and telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            ConsensusMessage::Proposal { .. } => "Proposal",
            ConsensusMessage::BlockPart { .. } => "BlockPart",
            ConsensusMessage::Vote { .. } => "Vote",
            ConsensusMessage::HasVote { .. } => "HasVote",
            ConsensusMessage::NewRoundStep { .. } => "NewRoundStep",
            ConsensusMessage::CommitStep { .. } => "CommitStep",
        }
    }

    /// True for messages that mutate round state (as opposed to gossip
    /// hints).
    pub fn is_state_input(&self) -> bool {
        matches!(
            self,
            ConsensusMessage::Proposal { .. }
                | ConsensusMessage::BlockPart { .. }
                | ConsensusMessage::Vote { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stanchion_types::PartSetHeader;

    #[test]
    fn messages_roundtrip_through_json() {
        let msg = ConsensusMessage::NewRoundStep {
            height: 3,
            round: 1,
            step: RoundStep::Prevote,
            seconds_since_start_time: 7,
            last_commit_round: 0,
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: ConsensusMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn commit_step_roundtrips() {
        let msg = ConsensusMessage::CommitStep {
            height: 9,
            block_parts_header: PartSetHeader::zero(),
            block_parts: BitArray::new(4),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(msg, serde_json::from_str::<ConsensusMessage>(&json).unwrap());
    }
}
