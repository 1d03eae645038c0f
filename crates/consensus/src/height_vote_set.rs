//! All vote sets for one height, keyed by round.

use crate::vote_set::{AddVoteOutcome, Maj23, VoteSet, VoteSetError};
use stanchion_types::{ValidatorSet, Vote, VoteType};
use std::collections::BTreeMap;
use std::sync::Arc;

struct RoundVoteSet {
    prevotes: VoteSet,
    precommits: VoteSet,
}

/// Prevotes and precommits for every round of the current height.
///
/// Rounds are created lazily; [`HeightVoteSet::set_round`] pre-allocates the
/// new round and the one after it, so round-skipping votes always have a home.
pub struct HeightVoteSet {
    chain_id: String,
    height: u64,
    validators: Arc<ValidatorSet>,
    round: u32,
    rounds: BTreeMap<u32, RoundVoteSet>,
}

impl HeightVoteSet {
    pub fn new(chain_id: impl Into<String>, height: u64, validators: Arc<ValidatorSet>) -> Self {
        let mut hvs = HeightVoteSet {
            chain_id: chain_id.into(),
            height,
            validators,
            round: 0,
            rounds: BTreeMap::new(),
        };
        hvs.ensure_round(0);
        hvs.ensure_round(1);
        hvs
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    /// Move to `round`, pre-allocating vote sets for it and the next round.
    pub fn set_round(&mut self, round: u32) {
        self.ensure_round(round);
        self.ensure_round(round + 1);
        self.round = round;
    }

    fn ensure_round(&mut self, round: u32) {
        if self.rounds.contains_key(&round) {
            return;
        }
        self.rounds.insert(
            round,
            RoundVoteSet {
                prevotes: VoteSet::new(
                    self.chain_id.clone(),
                    self.height,
                    round,
                    VoteType::Prevote,
                    self.validators.clone(),
                ),
                precommits: VoteSet::new(
                    self.chain_id.clone(),
                    self.height,
                    round,
                    VoteType::Precommit,
                    self.validators.clone(),
                ),
            },
        );
    }

    /// Route a vote to its (round, type) set.
    pub fn add_vote(&mut self, vote: &Vote) -> Result<AddVoteOutcome, VoteSetError> {
        self.ensure_round(vote.round);
        let rvs = self.rounds.get_mut(&vote.round).expect("round just ensured");
        match vote.vote_type {
            VoteType::Prevote => rvs.prevotes.add_vote(vote),
            VoteType::Precommit => rvs.precommits.add_vote(vote),
        }
    }

    pub fn prevotes(&mut self, round: u32) -> &VoteSet {
        self.ensure_round(round);
        &self.rounds[&round].prevotes
    }

    pub fn precommits(&mut self, round: u32) -> &VoteSet {
        self.ensure_round(round);
        &self.rounds[&round].precommits
    }

    /// Read-only lookup without allocating the round.
    pub fn get_prevotes(&self, round: u32) -> Option<&VoteSet> {
        self.rounds.get(&round).map(|rvs| &rvs.prevotes)
    }

    /// Read-only lookup without allocating the round.
    pub fn get_precommits(&self, round: u32) -> Option<&VoteSet> {
        self.rounds.get(&round).map(|rvs| &rvs.precommits)
    }

    /// The highest round with a 2/3 prevote majority for a real block, if
    /// any. This is the proof-of-lock round a proposer advertises.
    pub fn pol_round(&self) -> Option<u32> {
        self.rounds
            .iter()
            .rev()
            .find(|(_, rvs)| matches!(rvs.prevotes.two_thirds_majority(), Some(Maj23::Block(_))))
            .map(|(&round, _)| round)
    }

    /// `pol_round` in the wire encoding: -1 when there is none.
    pub fn pol_round_i32(&self) -> i32 {
        self.pol_round().map(|r| r as i32).unwrap_or(-1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stanchion_types::test_utils::{signed_vote, test_validator_set};
    use stanchion_types::{BlockId, Hash, KeyPair, PartSetHeader};

    const CHAIN_ID: &str = "test-chain";

    fn setup() -> (HeightVoteSet, Vec<KeyPair>) {
        let (validators, keys) = test_validator_set(4, 10);
        (HeightVoteSet::new(CHAIN_ID, 1, Arc::new(validators)), keys)
    }

    fn block_id(seed: &[u8]) -> BlockId {
        BlockId {
            hash: Hash::from_bytes(seed),
            parts: PartSetHeader {
                total: 1,
                hash: Hash::from_bytes(seed),
            },
        }
    }

    fn prevote(keys: &[KeyPair], i: u32, round: u32, id: Option<BlockId>) -> Vote {
        signed_vote(
            CHAIN_ID,
            &keys[i as usize],
            i,
            1,
            round,
            VoteType::Prevote,
            id,
            500,
        )
    }

    #[test]
    fn routes_votes_by_round_and_type() {
        let (mut hvs, keys) = setup();
        let id = block_id(b"x");
        hvs.add_vote(&prevote(&keys, 0, 0, Some(id))).unwrap();
        hvs.add_vote(&prevote(&keys, 1, 2, Some(id))).unwrap();
        assert!(hvs.prevotes(0).get_by_index(0).is_some());
        assert!(hvs.prevotes(2).get_by_index(1).is_some());
        assert!(hvs.precommits(0).get_by_index(0).is_none());
    }

    #[test]
    fn pol_round_is_highest_non_nil_majority() {
        let (mut hvs, keys) = setup();
        assert_eq!(hvs.pol_round(), None);
        assert_eq!(hvs.pol_round_i32(), -1);

        // Nil majority at round 0 is not a POL.
        for i in 0..3 {
            hvs.add_vote(&prevote(&keys, i, 0, None)).unwrap();
        }
        assert_eq!(hvs.pol_round(), None);

        // Block majority at round 1.
        let id = block_id(b"pol");
        for i in 0..3 {
            hvs.add_vote(&prevote(&keys, i, 1, Some(id))).unwrap();
        }
        assert_eq!(hvs.pol_round(), Some(1));

        // A later, higher round wins.
        for i in 0..3 {
            hvs.add_vote(&prevote(&keys, i, 3, Some(id))).unwrap();
        }
        assert_eq!(hvs.pol_round(), Some(3));
        assert_eq!(hvs.pol_round_i32(), 3);
    }

    #[test]
    fn set_round_preallocates_next() {
        let (mut hvs, _) = setup();
        hvs.set_round(5);
        assert_eq!(hvs.round(), 5);
        assert!(hvs.rounds.contains_key(&5));
        assert!(hvs.rounds.contains_key(&6));
    }
}
