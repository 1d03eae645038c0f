//! Block proposals.

use crate::crypto::Signature;
use crate::part_set::PartSetHeader;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A signed proposal for a block at (height, round).
///
/// `pol_round >= 0` claims a proof-of-lock: a 2/3 prevote majority for this
/// block at that earlier round. Validators must see those prevotes before
/// treating the proposal as complete. `pol_round == -1` claims none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub height: u64,
    pub round: u32,
    pub block_parts_header: PartSetHeader,
    pub pol_round: i32,
    /// Proposer's wall clock, milliseconds since epoch.
    pub timestamp: u64,
    pub signature: Signature,
}

impl Proposal {
    /// An unsigned proposal; the signature is filled in by the signer.
    pub fn new(
        height: u64,
        round: u32,
        block_parts_header: PartSetHeader,
        pol_round: i32,
        timestamp: u64,
    ) -> Self {
        Proposal {
            height,
            round,
            block_parts_header,
            pol_round,
            timestamp,
            signature: Signature::zero(),
        }
    }
}

impl fmt::Display for Proposal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Proposal{{{}/{} parts={} pol={}}}",
            self.height, self.round, self.block_parts_header, self.pol_round
        )
    }
}
