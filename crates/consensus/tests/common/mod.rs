//! Single-node test harness: one real consensus machine, scripted peers.

use stanchion_app::mock::KvApp;
use stanchion_app::{BlockExecutor, ChainState, MemBlockStore, MemKvStore, StateStore};
use stanchion_consensus::{ConsensusConfig, ConsensusState, FifoMempool};
use stanchion_core::{
    Action, ConsensusMessage, Event, MessageSource, PeerId, StateMachine, TimeoutInfo,
};
use stanchion_signer::{MemPrivValidator, PrivValidator};
use stanchion_types::test_utils::{signed_vote, test_validator_set};
use stanchion_types::{
    proposal_sign_bytes, Block, BlockId, Commit, ConsensusParams, DuplicateVoteEvidence, Hash,
    Header, KeyPair, PartSet, Proposal, Tx, Vote, VoteType,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

pub const CHAIN_ID: &str = "test-chain";

/// Drives one real consensus node; peer behavior is scripted by the test.
pub struct TestNode {
    pub cs: ConsensusState,
    pub keys: Vec<KeyPair>,
    pub our_index: u32,
    pub blocks: Arc<MemBlockStore>,
    pub evidence: Vec<DuplicateVoteEvidence>,
    /// Everything the node asked to broadcast, in order.
    pub broadcasts: Vec<ConsensusMessage>,
    queue: VecDeque<Event>,
    timeout: Option<TimeoutInfo>,
    now: Duration,
}

impl TestNode {
    pub fn new(n: usize, our_index: u32) -> Self {
        let (validators, keys) = test_validator_set(n, 10);
        let chain_state = ChainState::from_genesis(CHAIN_ID, validators, ConsensusParams::default());
        let state_store = StateStore::new(Arc::new(MemKvStore::new()));
        let mut executor = BlockExecutor::new(Box::new(KvApp::new()), state_store);
        executor.init_chain(&chain_state);
        let blocks = Arc::new(MemBlockStore::new());
        let pv: Arc<dyn PrivValidator> =
            Arc::new(MemPrivValidator::new(keys[our_index as usize].clone()));
        let mut cs = ConsensusState::new(
            ConsensusConfig::default(),
            chain_state,
            Some(pv),
            executor,
            blocks.clone(),
            Arc::new(FifoMempool::new()),
        );
        let now = Duration::from_secs(10);
        cs.set_time(now);
        TestNode {
            cs,
            keys,
            our_index,
            blocks,
            evidence: Vec::new(),
            broadcasts: Vec::new(),
            queue: VecDeque::new(),
            timeout: None,
            now,
        }
    }

    /// The validator index that proposes at (height 1, `round`).
    pub fn proposer_at_round(&self, round: u32) -> u32 {
        let mut validators = self.cs.chain_state().validators.clone();
        if round > 0 {
            validators.increment_accum(round);
        }
        let address = validators.proposer().address;
        validators.index_of(&address).unwrap()
    }

    /// An `our_index` that does not propose in rounds `0..rounds`.
    pub fn pick_non_proposer(n: usize, rounds: u32) -> u32 {
        let probe = TestNode::new(n, 0);
        let proposers: Vec<u32> = (0..rounds).map(|r| probe.proposer_at_round(r)).collect();
        (0..n as u32)
            .find(|i| !proposers.contains(i))
            .expect("some validator proposes in none of the early rounds")
    }

    // ─── driving ───

    pub fn start(&mut self) {
        let actions = self.cs.start();
        self.absorb(actions);
        self.drain();
    }

    fn absorb(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::EnqueueInternal { message } => self.queue.push_back(Event::Message {
                    msg: message,
                    from: MessageSource::Local,
                }),
                Action::ScheduleTimeout(ti) => {
                    let replace = match &self.timeout {
                        Some(current) => ti.supersedes(current),
                        None => true,
                    };
                    if replace {
                        self.timeout = Some(ti);
                    }
                }
                Action::PersistEvidence { evidence } => self.evidence.push(evidence),
                Action::Broadcast { message } => self.broadcasts.push(message),
                Action::PublishStep(_) => {}
            }
        }
    }

    fn drain(&mut self) {
        while let Some(event) = self.queue.pop_front() {
            self.cs.set_time(self.now);
            let actions = self.cs.handle(event);
            self.absorb(actions);
        }
    }

    /// Fire the pending timeout, advancing the clock by its duration.
    pub fn fire_timeout(&mut self) {
        let ti = self.timeout.take().expect("a timeout is pending");
        self.now += ti.duration;
        self.cs.set_time(self.now);
        let actions = self.cs.handle(Event::Timeout(ti));
        self.absorb(actions);
        self.drain();
    }

    pub fn deliver(&mut self, msg: ConsensusMessage) {
        self.now += Duration::from_millis(5);
        self.cs.set_time(self.now);
        let actions = self.cs.handle(Event::Message {
            msg,
            from: MessageSource::Peer(PeerId("peer".into())),
        });
        self.absorb(actions);
        self.drain();
    }

    // ─── crafting peer behavior ───

    /// A valid block for the current height, built from the node's own
    /// committed state. Different `time` values yield different blocks.
    pub fn make_block(&self, time: u64, txs: Vec<Tx>) -> (Block, PartSet, BlockId) {
        let state = self.cs.chain_state();
        let last_commit = if state.last_block_height == 0 {
            Commit::empty()
        } else {
            panic!("make_block beyond height 1 needs a commit; extend the harness");
        };
        let mut block = Block {
            header: Header {
                chain_id: state.chain_id.clone(),
                height: state.last_block_height + 1,
                time,
                num_txs: txs.len() as u64,
                last_block_id: state.last_block_id,
                last_commit_hash: last_commit.hash(),
                data_hash: Hash::ZERO,
                validators_hash: state.validators.hash(),
                consensus_hash: state.consensus_params.hash(),
                app_hash: state.last_app_hash,
                results_hash: state.last_results_hash,
                proposer_address: self.keys[0].address(),
            },
            data: txs,
            last_commit,
        };
        block.header.data_hash = block.data_hash();
        let parts = block.make_part_set(state.consensus_params.block_part_size_bytes);
        let id = block.block_id(&parts);
        (block, parts, id)
    }

    /// Deliver a signed proposal followed by all its block parts.
    pub fn deliver_proposal(
        &mut self,
        parts: &PartSet,
        round: u32,
        pol_round: i32,
        signer: &KeyPair,
    ) {
        let height = self.cs.height();
        let mut proposal = Proposal::new(height, round, parts.header(), pol_round, self.now_ms());
        proposal.signature = signer.sign(&proposal_sign_bytes(CHAIN_ID, &proposal));
        self.deliver(ConsensusMessage::Proposal { proposal });
        self.deliver_parts(parts, round);
    }

    pub fn deliver_parts(&mut self, parts: &PartSet, round: u32) {
        let height = self.cs.height();
        for index in 0..parts.total() {
            let part = parts.get_part(index).unwrap().clone();
            self.deliver(ConsensusMessage::BlockPart {
                height,
                round,
                part,
            });
        }
    }

    /// Deliver a vote signed by validator `index`.
    pub fn peer_vote(
        &mut self,
        index: u32,
        round: u32,
        vote_type: VoteType,
        block_id: Option<BlockId>,
    ) {
        let vote = self.peer_vote_signed(index, round, vote_type, block_id);
        self.deliver(ConsensusMessage::Vote {
            validator_index: index,
            vote,
        });
    }

    /// Build (but don't deliver) a vote signed by validator `index`.
    pub fn peer_vote_signed(
        &mut self,
        index: u32,
        round: u32,
        vote_type: VoteType,
        block_id: Option<BlockId>,
    ) -> Vote {
        self.now += Duration::from_millis(1);
        signed_vote(
            CHAIN_ID,
            &self.keys[index as usize],
            index,
            self.cs.height(),
            round,
            vote_type,
            block_id,
            self.now_ms(),
        )
    }

    /// Our own vote of the given type at `round`, if cast.
    pub fn our_vote(&self, round: u32, vote_type: VoteType) -> Option<Vote> {
        let votes = &self.cs.round_state().votes;
        let set = match vote_type {
            VoteType::Prevote => votes.get_prevotes(round)?,
            VoteType::Precommit => votes.get_precommits(round)?,
        };
        set.get_by_index(self.our_index).cloned()
    }

    pub fn now_ms(&self) -> u64 {
        self.now.as_millis() as u64
    }
}
