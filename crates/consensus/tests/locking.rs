//! Locking and unlocking across rounds.
//!
//! One real node among four validators (equal power 10, total 40). The other
//! three are scripted. The node locks on a block after a polka, keeps
//! prevoting it against competing proposals, and releases the lock only on a
//! later proof-of-lock for a different block.

mod common;

use common::TestNode;
use stanchion_app::BlockStore;
use stanchion_core::{ConsensusMessage, RoundStep};
use stanchion_types::VoteType;

/// Two scripted validator indices other than ours and `exclude`.
fn two_peers(n: u32, ours: u32, exclude: u32) -> (u32, u32) {
    let mut picks = (0..n).filter(|&i| i != ours && i != exclude);
    (picks.next().unwrap(), picks.next().unwrap())
}

#[test]
fn locked_node_ignores_competing_proposal() {
    let ours = TestNode::pick_non_proposer(4, 2);
    let mut t = TestNode::new(4, ours);
    let proposer0 = t.proposer_at_round(0);
    let proposer1 = t.proposer_at_round(1);
    let (peer_a, peer_b) = two_peers(4, ours, proposer0);

    t.start();
    t.fire_timeout(); // NewHeight -> round 0, waiting for a proposal

    // Round 0: proposer sends block B; we prevote it.
    let (block_b, parts_b, id_b) = t.make_block(5_000, vec![]);
    let signer0 = t.keys[proposer0 as usize].clone();
    t.deliver_proposal(&parts_b, 0, -1, &signer0);
    let our_prevote = t.our_vote(0, VoteType::Prevote).expect("we prevoted");
    assert_eq!(our_prevote.block_id, Some(id_b));

    // Two peers prevote B: 30/40 is a polka. We lock and precommit B.
    t.peer_vote(peer_a, 0, VoteType::Prevote, Some(id_b));
    t.peer_vote(peer_b, 0, VoteType::Prevote, Some(id_b));
    assert_eq!(t.cs.round_state().step, RoundStep::Precommit);
    assert!(t.cs.round_state().is_locked());
    assert_eq!(
        t.cs.round_state().locked_block.as_ref().unwrap().hash(),
        block_b.hash()
    );
    let our_precommit = t.our_vote(0, VoteType::Precommit).expect("we precommitted");
    assert_eq!(our_precommit.block_id, Some(id_b));

    // The other precommits are lost; peers only manage nil. 2/3-any moves us
    // to PrecommitWait, whose timeout sends us to round 1 - still locked.
    t.peer_vote(peer_a, 0, VoteType::Precommit, None);
    t.peer_vote(peer_b, 0, VoteType::Precommit, None);
    assert_eq!(t.cs.round_state().step, RoundStep::PrecommitWait);
    t.fire_timeout();
    assert_eq!(t.cs.round_state().round, 1);
    assert!(t.cs.round_state().is_locked());

    // Round 1: a different proposer offers B' != B. Locked validators
    // prevote B, not B'.
    let (block_b2, parts_b2, id_b2) = t.make_block(6_000, vec![]);
    assert_ne!(block_b2.hash(), block_b.hash());
    let signer1 = t.keys[proposer1 as usize].clone();
    t.deliver_proposal(&parts_b2, 1, -1, &signer1);

    let round1_prevote = t.our_vote(1, VoteType::Prevote).expect("we prevoted at round 1");
    assert_eq!(
        round1_prevote.block_id,
        Some(id_b),
        "a locked validator must prevote its lock, not the new proposal"
    );

    // Peers prevote B', but with our vote for B that is only 20/40 for B':
    // no polka for B'. After the prevote-wait timeout we precommit nil and
    // stay locked.
    t.peer_vote(peer_a, 1, VoteType::Prevote, Some(id_b2));
    t.peer_vote(peer_b, 1, VoteType::Prevote, Some(id_b2));
    assert_eq!(t.cs.round_state().step, RoundStep::PrevoteWait);
    t.fire_timeout();
    let round1_precommit = t.our_vote(1, VoteType::Precommit).expect("we precommitted");
    assert!(round1_precommit.is_nil());
    assert!(t.cs.round_state().is_locked());

    // B' was never committed.
    assert_eq!(t.blocks.height(), 0);
}

#[test]
fn later_pol_releases_the_lock() {
    let ours = TestNode::pick_non_proposer(4, 3);
    let mut t = TestNode::new(4, ours);
    let proposer0 = t.proposer_at_round(0);
    let proposer2 = t.proposer_at_round(2);
    let (peer_a, peer_b) = two_peers(4, ours, proposer0);
    // The remaining scripted validator (may be proposer0 itself).
    let peer_c = (0..4u32)
        .find(|&i| i != ours && i != peer_a && i != peer_b)
        .unwrap();

    t.start();
    t.fire_timeout();

    // Round 0: lock on B as in the locking test.
    let (block_b, parts_b, id_b) = t.make_block(5_000, vec![]);
    let signer0 = t.keys[proposer0 as usize].clone();
    t.deliver_proposal(&parts_b, 0, -1, &signer0);
    t.peer_vote(peer_a, 0, VoteType::Prevote, Some(id_b));
    t.peer_vote(peer_b, 0, VoteType::Prevote, Some(id_b));
    assert!(t.cs.round_state().is_locked());
    t.peer_vote(peer_a, 0, VoteType::Precommit, None);
    t.peer_vote(peer_b, 0, VoteType::Precommit, None);
    t.fire_timeout(); // precommit-wait -> round 1
    assert_eq!(t.cs.round_state().round, 1);

    // Round 1: all three peers prevote B'' (we keep prevoting B, locked).
    let (block_b2, parts_b2, id_b2) = t.make_block(6_000, vec![]);
    assert_ne!(block_b2.hash(), block_b.hash());
    t.peer_vote(peer_a, 1, VoteType::Prevote, Some(id_b2));
    t.peer_vote(peer_b, 1, VoteType::Prevote, Some(id_b2));
    assert!(t.cs.round_state().is_locked());

    // The third prevote makes 30/40 for B'' at round 1: a proof of lock for
    // a different block at a round later than ours. We unlock.
    t.peer_vote(peer_c, 1, VoteType::Prevote, Some(id_b2));
    assert!(
        !t.cs.round_state().is_locked(),
        "a POL for a different block at locked_round < r <= round must unlock"
    );
    assert_eq!(t.cs.round_state().locked_round, 0);

    // Get to round 2 via nil precommits.
    t.peer_vote(peer_a, 1, VoteType::Precommit, None);
    t.peer_vote(peer_b, 1, VoteType::Precommit, None);
    if t.cs.round_state().step == RoundStep::PrecommitWait {
        t.fire_timeout();
    }
    assert_eq!(t.cs.round_state().round, 2);

    // Round 2: the proposal advertises the round-1 POL for B''. Unlocked,
    // we are free to prevote it.
    let signer2 = t.keys[proposer2 as usize].clone();
    t.deliver_proposal(&parts_b2, 2, 1, &signer2);
    let round2_prevote = t.our_vote(2, VoteType::Prevote).expect("we prevoted at round 2");
    assert_eq!(round2_prevote.block_id, Some(id_b2));
}

#[test]
fn unlocked_proposer_advertises_live_pol_round() {
    // Our node proposes at round 2; rounds 0 and 1 belong to others.
    let probe = TestNode::new(4, 0);
    let ours = probe.proposer_at_round(2);
    assert_ne!(probe.proposer_at_round(0), ours);
    assert_ne!(probe.proposer_at_round(1), ours);
    drop(probe);
    let mut t = TestNode::new(4, ours);
    let peers: Vec<u32> = (0..4u32).filter(|&i| i != ours).collect();

    t.start();
    t.fire_timeout(); // NewHeight -> round 0, Propose (not ours)
    t.fire_timeout(); // Propose timeout -> we prevote nil

    // Round 0 dies on nil: a nil prevote polka, then nil precommits.
    t.peer_vote(peers[0], 0, VoteType::Prevote, None);
    t.peer_vote(peers[1], 0, VoteType::Prevote, None);
    t.peer_vote(peers[0], 0, VoteType::Precommit, None);
    t.peer_vote(peers[1], 0, VoteType::Precommit, None);
    assert_eq!(t.cs.round_state().round, 1);

    // Round 1: the others polka a block we never receive. We precommit nil
    // and stay unlocked, but the round-1 prevote majority is now live.
    let (_block, _parts, id_pol) = t.make_block(6_000, vec![]);
    for &peer in &peers {
        t.peer_vote(peer, 1, VoteType::Prevote, Some(id_pol));
    }
    assert!(!t.cs.round_state().is_locked());
    assert_eq!(t.cs.round_state().votes.pol_round_i32(), 1);

    // Round 1 also dies on nil precommits.
    t.peer_vote(peers[0], 1, VoteType::Precommit, None);
    t.peer_vote(peers[1], 1, VoteType::Precommit, None);
    assert_eq!(t.cs.round_state().round, 2);

    // Round 2: we are the proposer. Not locked, so we build a fresh block,
    // but the proposal we sign must still advertise the round-1 polka, not
    // claim there was none.
    let our_proposal = t.cs.round_state().proposal.clone().expect("we proposed");
    assert_eq!(our_proposal.round, 2);
    assert_eq!(our_proposal.pol_round, 1);

    let sent = t
        .broadcasts
        .iter()
        .find_map(|msg| match msg {
            ConsensusMessage::Proposal { proposal } if proposal.round == 2 => {
                Some(proposal.clone())
            }
            _ => None,
        })
        .expect("round-2 proposal was broadcast");
    assert_eq!(sent.pol_round, 1);
    assert_eq!(sent.signature, our_proposal.signature);

    // The block we propose and prevote is our own, not the polka block.
    let round2_prevote = t.our_vote(2, VoteType::Prevote).expect("we prevoted our proposal");
    assert!(!round2_prevote.is_nil());
    assert_ne!(round2_prevote.block_id, Some(id_pol));
}
