//! Canonical sign-bytes.
//!
//! Signatures cover a deterministic JSON encoding with lexicographically
//! ordered fields. Verification regenerates these exact bytes; two logically
//! equal votes always produce byte-equal sign-bytes.

use crate::block::BlockId;
use crate::proposal::Proposal;
use crate::vote::Vote;
use crate::Heartbeat;
use serde::Serialize;

// Field order in these structs is the serialization order; keep it sorted.

#[derive(Serialize)]
struct CanonicalPartSetHeader {
    hash: crate::hash::Hash,
    total: u32,
}

#[derive(Serialize)]
struct CanonicalBlockId {
    hash: crate::hash::Hash,
    parts: CanonicalPartSetHeader,
}

impl CanonicalBlockId {
    fn from(id: &BlockId) -> Self {
        CanonicalBlockId {
            hash: id.hash,
            parts: CanonicalPartSetHeader {
                hash: id.parts.hash,
                total: id.parts.total,
            },
        }
    }
}

#[derive(Serialize)]
struct CanonicalVote {
    block_id: Option<CanonicalBlockId>,
    height: u64,
    round: u32,
    timestamp: u64,
    #[serde(rename = "type")]
    vote_type: u8,
}

#[derive(Serialize)]
struct CanonicalVoteEnvelope<'a> {
    chain_id: &'a str,
    vote: CanonicalVote,
}

#[derive(Serialize)]
struct CanonicalProposal {
    block_parts_header: CanonicalPartSetHeader,
    height: u64,
    pol_round: i32,
    round: u32,
    timestamp: u64,
}

#[derive(Serialize)]
struct CanonicalProposalEnvelope<'a> {
    chain_id: &'a str,
    proposal: CanonicalProposal,
}

#[derive(Serialize)]
struct CanonicalHeartbeat {
    height: u64,
    round: u32,
    sequence: u64,
    validator_index: u32,
}

#[derive(Serialize)]
struct CanonicalHeartbeatEnvelope<'a> {
    chain_id: &'a str,
    heartbeat: CanonicalHeartbeat,
}

/// Canonical bytes a validator signs for a vote.
pub fn vote_sign_bytes(chain_id: &str, vote: &Vote) -> Vec<u8> {
    let envelope = CanonicalVoteEnvelope {
        chain_id,
        vote: CanonicalVote {
            block_id: vote.block_id.as_ref().map(CanonicalBlockId::from),
            height: vote.height,
            round: vote.round,
            timestamp: vote.timestamp,
            vote_type: vote.vote_type.as_byte(),
        },
    };
    serde_json::to_vec(&envelope).expect("canonical vote encoding must succeed")
}

/// Canonical bytes a proposer signs for a proposal.
pub fn proposal_sign_bytes(chain_id: &str, proposal: &Proposal) -> Vec<u8> {
    let envelope = CanonicalProposalEnvelope {
        chain_id,
        proposal: CanonicalProposal {
            block_parts_header: CanonicalPartSetHeader {
                hash: proposal.block_parts_header.hash,
                total: proposal.block_parts_header.total,
            },
            height: proposal.height,
            pol_round: proposal.pol_round,
            round: proposal.round,
            timestamp: proposal.timestamp,
        },
    };
    serde_json::to_vec(&envelope).expect("canonical proposal encoding must succeed")
}

/// Canonical bytes a validator signs for a heartbeat.
pub fn heartbeat_sign_bytes(chain_id: &str, heartbeat: &Heartbeat) -> Vec<u8> {
    let envelope = CanonicalHeartbeatEnvelope {
        chain_id,
        heartbeat: CanonicalHeartbeat {
            height: heartbeat.height,
            round: heartbeat.round,
            sequence: heartbeat.sequence,
            validator_index: heartbeat.validator_index,
        },
    };
    serde_json::to_vec(&envelope).expect("canonical heartbeat encoding must succeed")
}
