//! The per-height consensus state machine.
//!
//! Each height runs rounds 0, 1, 2, … of propose → prevote → precommit until
//! a block gathers a 2/3 precommit majority, at which point it is executed
//! against the application and the machine moves to the next height.
//!
//! The machine is driven entirely through [`StateMachine::handle`]: the
//! runner feeds it proposals, block parts, votes, and fired timeouts, and
//! executes the actions it returns. Locally signed messages are fed back
//! through the same queue, so exactly one mutator exists.

use crate::config::ConsensusConfig;
use crate::height_vote_set::HeightVoteSet;
use crate::round_state::RoundState;
use crate::vote_set::{AddVoteOutcome, Maj23, VoteSet, VoteSetError};
use crate::{ConsensusError, TxSource};
use stanchion_app::{BlockExecutor, BlockStore, ChainState};
use stanchion_core::{
    Action, ConsensusMessage, Event, MessageSource, RoundStep, RoundStepInfo, StateMachine,
    TimeoutInfo,
};
use stanchion_signer::PrivValidator;
use stanchion_types::{
    proposal_sign_bytes, Block, BlockId, Commit, Header, Part, PartSet, Proposal, Signature, Vote,
    VoteType,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// The consensus engine for one validator (or observer, when no private
/// validator is set).
pub struct ConsensusState {
    config: ConsensusConfig,
    /// Committed state up to height-1.
    chain_state: ChainState,
    /// Round state for the height in progress.
    rs: RoundState,

    priv_validator: Option<Arc<dyn PrivValidator>>,
    executor: BlockExecutor,
    block_store: Arc<dyn BlockStore>,
    mempool: Arc<dyn TxSource>,

    /// Wall clock, set by the runner before each `handle`.
    now: Duration,
    /// Actions accumulated during the current `handle`.
    pending: Vec<Action>,
}

impl ConsensusState {
    pub fn new(
        config: ConsensusConfig,
        chain_state: ChainState,
        priv_validator: Option<Arc<dyn PrivValidator>>,
        executor: BlockExecutor,
        block_store: Arc<dyn BlockStore>,
        mempool: Arc<dyn TxSource>,
    ) -> Self {
        let rs = Self::fresh_round_state(&chain_state, Duration::ZERO, &config);
        let mut cs = ConsensusState {
            config,
            chain_state,
            rs,
            priv_validator,
            executor,
            block_store,
            mempool,
            now: Duration::ZERO,
            pending: Vec::new(),
        };
        cs.reconstruct_last_commit();
        cs
    }

    fn fresh_round_state(
        state: &ChainState,
        start_time: Duration,
        _config: &ConsensusConfig,
    ) -> RoundState {
        let height = state.last_block_height + 1;
        RoundState {
            height,
            round: 0,
            step: RoundStep::NewHeight,
            start_time,
            commit_time: Duration::ZERO,
            validators: state.validators.clone(),
            proposal: None,
            proposal_block: None,
            proposal_block_parts: None,
            locked_round: 0,
            locked_block: None,
            locked_block_parts: None,
            votes: HeightVoteSet::new(
                state.chain_id.clone(),
                height,
                Arc::new(state.validators.clone()),
            ),
            commit_round: None,
            last_commit: None,
            last_validators: state.last_validators.clone(),
        }
    }

    // ───────────────────────────── accessors ─────────────────────────────

    pub fn round_state(&self) -> &RoundState {
        &self.rs
    }

    pub fn chain_state(&self) -> &ChainState {
        &self.chain_state
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub fn height(&self) -> u64 {
        self.rs.height
    }

    fn chain_id(&self) -> &str {
        &self.chain_state.chain_id
    }

    fn now_ms(&self) -> u64 {
        self.now.as_millis() as u64
    }

    /// True if our validator is the designated proposer for the current
    /// round.
    pub fn is_proposer(&self) -> bool {
        match &self.priv_validator {
            Some(pv) => self.rs.validators.proposer().address == pv.address(),
            None => false,
        }
    }

    /// Kick off the machine: schedule round 0 of the current height.
    pub fn start(&mut self) -> Vec<Action> {
        self.schedule_round0();
        std::mem::take(&mut self.pending)
    }

    // ───────────────────────────── action plumbing ─────────────────────────────

    fn push(&mut self, action: Action) {
        self.pending.push(action);
    }

    fn broadcast(&mut self, message: ConsensusMessage) {
        self.push(Action::Broadcast { message });
    }

    fn send_internal(&mut self, message: ConsensusMessage) {
        self.push(Action::EnqueueInternal { message });
    }

    fn schedule_timeout(&mut self, duration: Duration, height: u64, round: u32, step: RoundStep) {
        self.push(Action::ScheduleTimeout(TimeoutInfo {
            duration,
            height,
            round,
            step,
        }));
    }

    fn update_round_step(&mut self, round: u32, step: RoundStep) {
        self.rs.round = round;
        self.rs.step = step;
    }

    /// Publish a completed step: WAL checkpoint, observer callback, and the
    /// peer progress broadcast.
    fn new_step(&mut self) {
        let info = RoundStepInfo {
            height: self.rs.height,
            round: self.rs.round,
            step: self.rs.step,
        };
        self.push(Action::PublishStep(info));
        let seconds_since_start_time = self
            .now
            .saturating_sub(self.rs.start_time)
            .as_secs();
        let msg = ConsensusMessage::NewRoundStep {
            height: self.rs.height,
            round: self.rs.round,
            step: self.rs.step,
            seconds_since_start_time,
            last_commit_round: self.rs.last_commit_round_i32(),
        };
        self.broadcast(msg);
    }

    /// Schedule the transition into round 0 at `start_time`.
    fn schedule_round0(&mut self) {
        let sleep = if self.config.skip_timeout_commit {
            Duration::ZERO
        } else {
            self.rs.start_time.saturating_sub(self.now)
        };
        self.schedule_timeout(sleep, self.rs.height, 0, RoundStep::NewHeight);
    }

    // ───────────────────────────── height transitions ─────────────────────────────

    /// Rebuild the last-commit vote set from the block store, so the next
    /// proposal can carry it and straggler precommits have a home.
    fn reconstruct_last_commit(&mut self) {
        if self.chain_state.last_block_height == 0 {
            return;
        }
        let height = self.chain_state.last_block_height;
        let seen_commit = self
            .block_store
            .load_seen_commit(height)
            .unwrap_or_else(|| {
                panic!(
                    "failed to reconstruct last commit: no seen commit for height {}",
                    height
                )
            });
        let mut last_precommits = VoteSet::new(
            self.chain_id().to_string(),
            height,
            seen_commit.round(),
            VoteType::Precommit,
            Arc::new(self.chain_state.last_validators.clone()),
        );
        for vote in seen_commit.precommits.iter().flatten() {
            if let Err(e) = last_precommits.add_vote(vote) {
                panic!("failed to reconstruct last commit: {}", e);
            }
        }
        if !last_precommits.has_two_thirds_majority() {
            panic!("failed to reconstruct last commit: no +2/3 majority");
        }
        self.rs.last_commit = Some(last_precommits);
    }

    /// Move the machine to the next height described by `state`.
    ///
    /// Round becomes 0, step becomes NewHeight, and round 0 starts at
    /// `max(commit_time, now) + timeout_commit`.
    fn update_to_state(&mut self, state: ChainState) {
        if let Some(commit_round) = self.rs.commit_round {
            if self.rs.height != state.last_block_height {
                panic!(
                    "update_to_state expected state height {} but got {}",
                    self.rs.height, state.last_block_height
                );
            }
            if !self
                .rs
                .votes
                .precommits(commit_round)
                .has_two_thirds_majority()
            {
                panic!("update_to_state called but commit round has no +2/3");
            }
        }

        let height = state.last_block_height + 1;

        // Carry the committing precommits over as the new LastCommit.
        let last_commit = self.rs.commit_round.map(|commit_round| {
            let precommits = self.rs.votes.precommits(commit_round);
            let mut carried = VoteSet::new(
                state.chain_id.clone(),
                state.last_block_height,
                commit_round,
                VoteType::Precommit,
                Arc::new(state.last_validators.clone()),
            );
            for index in 0..precommits.size() as u32 {
                if let Some(vote) = precommits.get_by_index(index) {
                    // Ignore votes that are not part of the majority; the
                    // carried set only needs the committing 2/3.
                    let _ = carried.add_vote(vote);
                }
            }
            carried
        });

        let start_time = if self.rs.commit_time.is_zero() {
            // Fresh start: give ourselves one commit timeout to gather
            // transactions and peers.
            self.now + self.config.timeout_commit
        } else {
            self.rs.commit_time.max(self.now) + self.config.timeout_commit
        };

        self.rs = RoundState {
            height,
            round: 0,
            step: RoundStep::NewHeight,
            start_time,
            commit_time: Duration::ZERO,
            validators: state.validators.clone(),
            proposal: None,
            proposal_block: None,
            proposal_block_parts: None,
            locked_round: 0,
            locked_block: None,
            locked_block_parts: None,
            votes: HeightVoteSet::new(
                state.chain_id.clone(),
                height,
                Arc::new(state.validators.clone()),
            ),
            commit_round: None,
            last_commit,
            last_validators: state.last_validators.clone(),
        };
        self.chain_state = state;
        self.new_step();
    }

    // ───────────────────────────── event handling ─────────────────────────────

    fn handle_msg(&mut self, msg: ConsensusMessage, from: MessageSource) {
        match msg {
            ConsensusMessage::Proposal { proposal } => {
                if let Err(e) = self.set_proposal(proposal) {
                    warn!(error = %e, ?from, "Rejected proposal");
                }
            }
            ConsensusMessage::BlockPart { height, part, .. } => {
                if let Err(e) = self.add_proposal_block_part(height, part) {
                    warn!(error = %e, ?from, "Rejected block part");
                }
            }
            ConsensusMessage::Vote { vote, .. } => {
                if let Err(e) = self.try_add_vote(vote) {
                    match e {
                        ConsensusError::VoteHeightMismatch { .. } => {
                            trace!(error = %e, "Ignoring vote from another height")
                        }
                        _ => warn!(error = %e, ?from, "Error adding vote"),
                    }
                }
            }
            // Gossip coordination hints; acted on by the transport layer,
            // not the state machine.
            ConsensusMessage::HasVote { .. }
            | ConsensusMessage::NewRoundStep { .. }
            | ConsensusMessage::CommitStep { .. } => {
                trace!(msg = msg.type_name(), "Ignoring gossip hint")
            }
        }
    }

    fn handle_timeout(&mut self, ti: TimeoutInfo) {
        debug!(timeout = %ti, "Received tock");

        // Timeouts must be for the current height, round, and step (or
        // newer); anything older is a stale fire.
        if ti.height != self.rs.height
            || ti.round < self.rs.round
            || (ti.round == self.rs.round && ti.step < self.rs.step)
        {
            debug!(timeout = %ti, height = self.rs.height, round = self.rs.round,
                   step = %self.rs.step, "Ignoring tock because we're ahead");
            return;
        }

        match ti.step {
            RoundStep::NewHeight => {
                self.enter_new_round(ti.height, 0);
            }
            RoundStep::Propose => {
                self.enter_prevote(ti.height, ti.round);
            }
            RoundStep::PrevoteWait => {
                self.enter_precommit(ti.height, ti.round);
            }
            RoundStep::PrecommitWait => {
                self.enter_new_round(ti.height, ti.round + 1);
            }
            step => warn!(%step, "Invalid timeout step"),
        }
    }

    // ───────────────────────────── round steps ─────────────────────────────

    /// Enter: round 0 at `start_time`; 2/3-any precommits from round-1; the
    /// PrecommitWait timeout; or a round-skipping 2/3-any at a future round.
    fn enter_new_round(&mut self, height: u64, round: u32) {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step != RoundStep::NewHeight)
        {
            debug!(
                height, round,
                current = %self.rs,
                "enter_new_round: invalid args"
            );
            return;
        }
        if self.rs.start_time > self.now {
            warn!(start_time = ?self.rs.start_time, now = ?self.now, "Entering new round early");
        }
        info!(height, round, step = %self.rs.step, "enter_new_round");

        // Advance the proposer rotation for skipped rounds.
        if self.rs.round < round {
            let skip = round - self.rs.round;
            self.rs.validators.increment_accum(skip);
        }

        self.update_round_step(round, RoundStep::NewRound);
        if round == 0 {
            // Proposal state was reset on the height change; a round-0
            // proposal may already have arrived during NewHeight and must
            // survive.
        } else {
            self.rs.proposal = None;
            self.rs.proposal_block = None;
            self.rs.proposal_block_parts = None;
        }
        self.rs.votes.set_round(round + 1); // track next round to allow round-skipping

        self.enter_propose(height, round);
    }

    /// Enter: from NewRound. Proposer signs and sends; everyone schedules
    /// the propose timeout.
    fn enter_propose(&mut self, height: u64, round: u32) {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= RoundStep::Propose)
        {
            debug!(height, round, current = %self.rs, "enter_propose: invalid args");
            return;
        }
        info!(height, round, "enter_propose");

        self.schedule_timeout(
            self.config.propose_timeout(round),
            height,
            round,
            RoundStep::Propose,
        );

        if self.priv_validator.is_some() {
            if self.is_proposer() {
                info!(height, round, "Our turn to propose");
                self.decide_proposal(height, round);
            } else {
                debug!(
                    height, round,
                    proposer = %self.rs.validators.proposer().address,
                    "Not our turn to propose"
                );
            }
        }

        self.update_round_step(round, RoundStep::Propose);
        self.new_step();

        // The proposal might already be complete (locked block, or round-0
        // proposal received during NewHeight).
        if self.is_proposal_complete() {
            self.enter_prevote(height, self.rs.round);
        }
    }

    fn decide_proposal(&mut self, height: u64, round: u32) {
        let (block, parts) = if self.rs.locked_block.is_some() {
            // Locked: re-propose the locked block.
            (
                self.rs.locked_block.clone().unwrap(),
                self.rs.locked_block_parts.clone().unwrap(),
            )
        } else {
            match self.create_proposal_block() {
                Some(pair) => pair,
                None => return,
            }
        };

        let pol_round = if self.rs.locked_block.is_some() {
            self.rs.locked_round as i32
        } else {
            self.rs.votes.pol_round_i32()
        };

        let mut proposal = Proposal::new(height, round, parts.header(), pol_round, self.now_ms());
        let Some(pv) = self.priv_validator.clone() else {
            return;
        };
        match pv.sign_proposal(self.chain_id(), &mut proposal) {
            Ok(()) => {
                info!(height, round, %proposal, "Signed and sent proposal");
                // Peers get the proposal and parts directly; our own copy
                // travels through the internal queue like any other message.
                let msg = ConsensusMessage::Proposal { proposal };
                self.broadcast(msg.clone());
                self.send_internal(msg);
                for index in 0..parts.total() {
                    let part = parts.get_part(index).expect("complete part set").clone();
                    let msg = ConsensusMessage::BlockPart {
                        height,
                        round,
                        part,
                    };
                    self.broadcast(msg.clone());
                    self.send_internal(msg);
                }
            }
            Err(e) => warn!(height, round, error = %e, "Error signing proposal"),
        }
    }

    /// True if we hold the whole proposal block and, when the proposal
    /// advertises a proof-of-lock round, the 2/3 prevotes from it.
    fn is_proposal_complete(&mut self) -> bool {
        let Some(proposal) = &self.rs.proposal else {
            return false;
        };
        if self.rs.proposal_block.is_none() {
            return false;
        }
        if proposal.pol_round < 0 {
            true
        } else {
            let pol_round = proposal.pol_round as u32;
            self.rs.votes.prevotes(pol_round).has_two_thirds_majority()
        }
    }

    /// Build the next block from committed state and mempool transactions.
    fn create_proposal_block(&mut self) -> Option<(Block, PartSet)> {
        let last_commit = if self.rs.height == 1 {
            Commit::empty()
        } else {
            match &self.rs.last_commit {
                Some(vs) if vs.has_two_thirds_majority() => vs.make_commit(),
                _ => {
                    error!("Cannot propose: no commit for the previous block");
                    return None;
                }
            }
        };

        let txs = self
            .mempool
            .reap(self.chain_state.consensus_params.max_block_txs);

        let mut block = Block {
            header: Header {
                chain_id: self.chain_id().to_string(),
                height: self.rs.height,
                time: self.now_ms(),
                num_txs: txs.len() as u64,
                last_block_id: self.chain_state.last_block_id,
                last_commit_hash: last_commit.hash(),
                data_hash: stanchion_types::Hash::ZERO,
                validators_hash: self.chain_state.validators.hash(),
                consensus_hash: self.chain_state.consensus_params.hash(),
                app_hash: self.chain_state.last_app_hash,
                results_hash: self.chain_state.last_results_hash,
                proposer_address: self
                    .priv_validator
                    .as_ref()
                    .expect("create_proposal_block without priv validator")
                    .address(),
            },
            data: txs,
            last_commit,
        };
        block.header.data_hash = block.data_hash();
        let parts = block.make_part_set(self.chain_state.consensus_params.block_part_size_bytes);
        Some((block, parts))
    }

    /// Enter: proposal complete; the Propose timeout; or 2/3-any prevotes at
    /// this or a future round. Prevote the locked block, a valid proposal
    /// block, or nil.
    fn enter_prevote(&mut self, height: u64, round: u32) {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= RoundStep::Prevote)
        {
            debug!(height, round, current = %self.rs, "enter_prevote: invalid args");
            return;
        }
        info!(height, round, "enter_prevote");

        self.do_prevote(height, round);
        self.update_round_step(round, RoundStep::Prevote);
        self.new_step();
        // Once 2/3-any prevotes arrive we move to PrevoteWait via add_vote.
    }

    fn do_prevote(&mut self, _height: u64, _round: u32) {
        // Locked: prevote the lock no matter what was proposed.
        if let Some(locked) = &self.rs.locked_block {
            debug!("Prevoting locked block");
            let block_id = BlockId {
                hash: locked.hash(),
                parts: self
                    .rs
                    .locked_block_parts
                    .as_ref()
                    .expect("locked block without parts")
                    .header(),
            };
            self.sign_add_vote(VoteType::Prevote, Some(block_id));
            return;
        }

        let Some(block) = self.rs.proposal_block.clone() else {
            warn!("Prevoting nil: no proposal block");
            self.sign_add_vote(VoteType::Prevote, None);
            return;
        };

        if let Err(e) = self.executor.validate_block(&self.chain_state, &block) {
            warn!(error = %e, "Prevoting nil: proposal block is invalid");
            self.sign_add_vote(VoteType::Prevote, None);
            return;
        }

        let block_id = BlockId {
            hash: block.hash(),
            parts: self
                .rs
                .proposal_block_parts
                .as_ref()
                .expect("proposal block without parts")
                .header(),
        };
        self.sign_add_vote(VoteType::Prevote, Some(block_id));
    }

    /// Enter: the first 2/3-any prevotes at `round`.
    fn enter_prevote_wait(&mut self, height: u64, round: u32) {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= RoundStep::PrevoteWait)
        {
            debug!(height, round, current = %self.rs, "enter_prevote_wait: invalid args");
            return;
        }
        if !self.rs.votes.prevotes(round).has_two_thirds_any() {
            panic!(
                "enter_prevote_wait({}/{}) without +2/3 prevotes",
                height, round
            );
        }
        info!(height, round, "enter_prevote_wait");

        self.update_round_step(round, RoundStep::PrevoteWait);
        self.new_step();
        self.schedule_timeout(
            self.config.prevote_timeout(round),
            height,
            round,
            RoundStep::PrevoteWait,
        );
    }

    /// Enter: a 2/3-one prevote majority; the PrevoteWait timeout; or
    /// 2/3-any precommits at a future round.
    ///
    /// Lock and precommit the proposal block if it got the majority, unlock
    /// on a nil majority, and precommit nil otherwise.
    fn enter_precommit(&mut self, height: u64, round: u32) {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= RoundStep::Precommit)
        {
            debug!(height, round, current = %self.rs, "enter_precommit: invalid args");
            return;
        }
        info!(height, round, "enter_precommit");

        let maj23 = self.rs.votes.prevotes(round).two_thirds_majority();

        let finish = |cs: &mut Self| {
            cs.update_round_step(round, RoundStep::Precommit);
            cs.new_step();
        };

        // No polka: precommit nil, keep any lock.
        let Some(maj) = maj23 else {
            debug!("No +2/3 prevotes; precommitting nil");
            self.sign_add_vote(VoteType::Precommit, None);
            finish(self);
            return;
        };

        match maj {
            Maj23::Nil => {
                // 2/3 prevoted nil: release any lock, precommit nil.
                if self.rs.locked_block.is_some() {
                    info!("+2/3 prevoted nil; unlocking");
                    self.unlock();
                }
                self.sign_add_vote(VoteType::Precommit, None);
                finish(self);
            }
            Maj23::Block(block_id) => {
                if self
                    .rs
                    .locked_block
                    .as_ref()
                    .is_some_and(|b| b.hash() == block_id.hash)
                {
                    // Already locked on this block: refresh the lock round.
                    info!(round, "+2/3 prevoted locked block; relocking");
                    self.rs.locked_round = round;
                    self.sign_add_vote(VoteType::Precommit, Some(block_id));
                    finish(self);
                    return;
                }

                if self
                    .rs
                    .proposal_block
                    .as_ref()
                    .is_some_and(|b| b.hash() == block_id.hash)
                {
                    // Polka for the proposal block: validate, lock, precommit.
                    let block = self.rs.proposal_block.clone().unwrap();
                    if let Err(e) = self.executor.validate_block(&self.chain_state, &block) {
                        panic!("+2/3 prevoted for an invalid block: {}", e);
                    }
                    info!(round, hash = ?block_id.hash, "Locking on proposal block");
                    self.rs.locked_round = round;
                    self.rs.locked_block = Some(block);
                    self.rs.locked_block_parts = self.rs.proposal_block_parts.clone();
                    self.sign_add_vote(VoteType::Precommit, Some(block_id));
                    finish(self);
                    return;
                }

                // Polka for a block we don't have. The polka itself is the
                // proof-of-lock justifying the unlock; set up to fetch the
                // block and precommit nil.
                info!(round, hash = ?block_id.hash, "Polka for a block we don't have; unlocking");
                self.unlock();
                if !self
                    .rs
                    .proposal_block_parts
                    .as_ref()
                    .is_some_and(|p| p.has_header(&block_id.parts))
                {
                    self.rs.proposal_block = None;
                    self.rs.proposal_block_parts = Some(PartSet::from_header(block_id.parts));
                }
                self.sign_add_vote(VoteType::Precommit, None);
                finish(self);
            }
        }
    }

    fn unlock(&mut self) {
        self.rs.locked_round = 0;
        self.rs.locked_block = None;
        self.rs.locked_block_parts = None;
    }

    /// Enter: the first 2/3-any precommits at `round`.
    fn enter_precommit_wait(&mut self, height: u64, round: u32) {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= RoundStep::PrecommitWait)
        {
            debug!(height, round, current = %self.rs, "enter_precommit_wait: invalid args");
            return;
        }
        if !self.rs.votes.precommits(round).has_two_thirds_any() {
            panic!(
                "enter_precommit_wait({}/{}) without +2/3 precommits",
                height, round
            );
        }
        info!(height, round, "enter_precommit_wait");

        self.update_round_step(round, RoundStep::PrecommitWait);
        self.new_step();
        self.schedule_timeout(
            self.config.precommit_timeout(round),
            height,
            round,
            RoundStep::PrecommitWait,
        );
        // At expiry: enter_new_round(height, round + 1).
    }

    /// Enter: a 2/3 precommit majority for a block at `commit_round`.
    fn enter_commit(&mut self, height: u64, commit_round: u32) {
        if self.rs.height != height || self.rs.step >= RoundStep::Commit {
            debug!(height, commit_round, current = %self.rs, "enter_commit: invalid args");
            return;
        }
        info!(height, commit_round, "enter_commit");

        let Some(Maj23::Block(block_id)) = self.rs.votes.precommits(commit_round).two_thirds_majority()
        else {
            panic!("enter_commit expects +2/3 precommits for a block");
        };

        self.rs.commit_time = self.now;

        // The lock no longer matters; promote it to proposal block if it is
        // the committed one.
        if self
            .rs
            .locked_block
            .as_ref()
            .is_some_and(|b| b.hash() == block_id.hash)
        {
            self.rs.proposal_block = self.rs.locked_block.clone();
            self.rs.proposal_block_parts = self.rs.locked_block_parts.clone();
        }

        // If we don't have the committed block, set up to collect its parts.
        // We stay in Commit (no more round advances) until it is complete.
        if !self
            .rs
            .proposal_block
            .as_ref()
            .is_some_and(|b| b.hash() == block_id.hash)
            && !self
                .rs
                .proposal_block_parts
                .as_ref()
                .is_some_and(|p| p.has_header(&block_id.parts))
        {
            self.rs.proposal_block = None;
            self.rs.proposal_block_parts = Some(PartSet::from_header(block_id.parts));
        }

        // Keep the round as is; it points at the committing precommit set.
        let round = self.rs.round;
        self.update_round_step(round, RoundStep::Commit);
        self.rs.commit_round = Some(commit_round);
        self.new_step();

        // Tell lagging peers what to fetch.
        if let Some(parts) = &self.rs.proposal_block_parts {
            let msg = ConsensusMessage::CommitStep {
                height,
                block_parts_header: parts.header(),
                block_parts: parts.bit_array(),
            };
            self.broadcast(msg);
        }

        self.try_finalize_commit(height);
    }

    /// Finalize if we hold the complete committed block.
    fn try_finalize_commit(&mut self, height: u64) {
        if self.rs.height != height {
            panic!(
                "try_finalize_commit: height mismatch {} vs {}",
                self.rs.height, height
            );
        }
        let Some(commit_round) = self.rs.commit_round else {
            return;
        };
        let Some(Maj23::Block(block_id)) = self.rs.votes.precommits(commit_round).two_thirds_majority()
        else {
            warn!("Attempt to finalize without a +2/3 block majority");
            return;
        };
        if !self
            .rs
            .proposal_block
            .as_ref()
            .is_some_and(|b| b.hash() == block_id.hash)
        {
            debug!("Cannot finalize yet: we don't have the committed block");
            return;
        }
        self.finalize_commit(height);
    }

    /// Execute the committed block, persist everything, move to the next
    /// height, and schedule its round 0.
    fn finalize_commit(&mut self, height: u64) {
        if self.rs.height != height || self.rs.step != RoundStep::Commit {
            debug!(height, current = %self.rs, "finalize_commit: invalid args");
            return;
        }
        let commit_round = self.rs.commit_round.expect("commit step without commit round");
        let Some(Maj23::Block(block_id)) = self.rs.votes.precommits(commit_round).two_thirds_majority()
        else {
            panic!("finalize_commit without a +2/3 block majority");
        };

        let block = self.rs.proposal_block.clone().expect("finalize without block");
        let parts = self
            .rs
            .proposal_block_parts
            .clone()
            .expect("finalize without block parts");
        assert!(
            parts.has_header(&block_id.parts),
            "committed parts header must match the majority block id"
        );
        assert_eq!(
            block.hash(),
            block_id.hash,
            "committed block must hash to the majority block id"
        );

        info!(height, hash = ?block_id.hash, txs = block.data.len(), "Finalizing commit");

        // Save the block with the precommits that committed it.
        let seen_commit = self.rs.votes.precommits(commit_round).make_commit();
        if self.block_store.height() < block.height() {
            self.block_store.save_block(&block, &parts, &seen_commit);
        }

        // Execute against the application. A failure here means 2/3 of the
        // network committed a block we cannot execute; there is no safe way
        // to continue.
        let next_state = self
            .executor
            .apply_block(&self.chain_state, block_id, &block)
            .unwrap_or_else(|e| panic!("failed to apply committed block {}: {}", height, e));

        self.mempool.update(height, &block.data);

        // Move to the next height and schedule its round 0 after the commit
        // timeout.
        self.update_to_state(next_state);
        self.schedule_round0();
    }

    // ───────────────────────────── proposals and parts ─────────────────────────────

    fn set_proposal(&mut self, proposal: Proposal) -> Result<(), ConsensusError> {
        // Already have one.
        if self.rs.proposal.is_some() {
            return Ok(());
        }
        // Does not apply.
        if proposal.height != self.rs.height || proposal.round != self.rs.round {
            return Ok(());
        }
        // Too late for a proposal once we are committing.
        if self.rs.step >= RoundStep::Commit {
            return Ok(());
        }

        // POLRound must be -1 or in [0, round).
        if proposal.pol_round != -1
            && (proposal.pol_round < 0 || proposal.pol_round as u32 >= proposal.round)
        {
            return Err(ConsensusError::InvalidProposalPolRound);
        }

        // Signed by the round's deterministic proposer.
        let proposer = self.rs.validators.proposer();
        let sign_bytes = proposal_sign_bytes(self.chain_id(), &proposal);
        if !proposer.pub_key.verify(&sign_bytes, &proposal.signature) {
            return Err(ConsensusError::InvalidProposalSignature);
        }

        debug!(%proposal, "Got proposal");
        self.rs.proposal_block_parts = Some(PartSet::from_header(proposal.block_parts_header));
        self.rs.proposal = Some(proposal);
        Ok(())
    }

    fn add_proposal_block_part(&mut self, height: u64, part: Part) -> Result<(), ConsensusError> {
        // Blocks can be re-proposed across rounds, so only the height must
        // match.
        if self.rs.height != height {
            return Ok(());
        }
        let Some(parts) = self.rs.proposal_block_parts.as_mut() else {
            // Not expecting a block part.
            return Ok(());
        };

        let added = parts.add_part(part)?;
        if added && parts.is_complete() {
            let bytes = parts.assemble().expect("complete part set assembles");
            let block = Block::from_part_set_bytes(&bytes)?;
            info!(hash = ?block.hash(), height, "Received complete proposal block");
            self.rs.proposal_block = Some(block);

            if self.rs.step == RoundStep::Propose && self.is_proposal_complete() {
                self.enter_prevote(height, self.rs.round);
            } else if self.rs.step == RoundStep::Commit {
                // We were waiting on these parts to finalize.
                self.try_finalize_commit(height);
            }
        }
        Ok(())
    }

    // ───────────────────────────── votes ─────────────────────────────

    fn try_add_vote(&mut self, vote: Vote) -> Result<(), ConsensusError> {
        match self.add_vote(vote) {
            Ok(()) => Ok(()),
            Err(ConsensusError::AddingVote(VoteSetError::Conflicting(evidence))) => {
                // Byzantine: persist the pair for slashing, drop the vote.
                warn!(evidence = %evidence, "Found conflicting vote; persisting evidence");
                self.push(Action::PersistEvidence {
                    evidence: *evidence,
                });
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn add_vote(&mut self, vote: Vote) -> Result<(), ConsensusError> {
        trace!(%vote, height = self.rs.height, "add_vote");

        // A precommit for the previous height, arriving late? Only useful
        // while we are still in NewHeight gathering stragglers.
        if vote.height + 1 == self.rs.height {
            if !(self.rs.step == RoundStep::NewHeight && vote.vote_type == VoteType::Precommit) {
                return Err(ConsensusError::VoteHeightMismatch {
                    expected: self.rs.height,
                    got: vote.height,
                });
            }
            if let Some(last_commit) = self.rs.last_commit.as_mut() {
                if matches!(last_commit.add_vote(&vote), Ok(AddVoteOutcome::Added)) {
                    debug!(%vote, "Added straggler to last commit");
                    self.broadcast_has_vote(&vote);
                }
            }
            return Ok(());
        }

        if vote.height != self.rs.height {
            return Err(ConsensusError::VoteHeightMismatch {
                expected: self.rs.height,
                got: vote.height,
            });
        }

        let outcome = self.rs.votes.add_vote(&vote)?;
        if outcome != AddVoteOutcome::Added {
            return Ok(());
        }
        self.broadcast_has_vote(&vote);

        let height = self.rs.height;
        match vote.vote_type {
            VoteType::Prevote => {
                let round = vote.round;
                let (maj23, any, majority) = {
                    let prevotes = self.rs.votes.prevotes(round);
                    (
                        prevotes.two_thirds_majority(),
                        prevotes.has_two_thirds_any(),
                        prevotes.has_two_thirds_majority(),
                    )
                };

                // Lock release: a valid proof-of-lock for a different block
                // at a later round than our lock lets us unlock.
                if self.rs.locked_block.is_some()
                    && self.rs.locked_round < round
                    && round <= self.rs.round
                {
                    if let Some(Maj23::Block(id)) = maj23 {
                        if self.rs.locked_block.as_ref().is_some_and(|b| b.hash() != id.hash) {
                            info!(
                                locked_round = self.rs.locked_round,
                                pol_round = round,
                                "Unlocking because of POL"
                            );
                            self.unlock();
                        }
                    }
                }

                if self.rs.round <= round && any {
                    // Round-skip to PrevoteWait, or straight to Precommit on
                    // a full polka.
                    self.enter_new_round(height, round);
                    if majority {
                        self.enter_precommit(height, round);
                    } else {
                        self.enter_prevote(height, round);
                        self.enter_prevote_wait(height, round);
                    }
                } else if let Some(proposal) = &self.rs.proposal {
                    // Maybe these prevotes complete the advertised POL.
                    if proposal.pol_round >= 0 && proposal.pol_round as u32 == round {
                        let current_round = self.rs.round;
                        if self.is_proposal_complete() {
                            self.enter_prevote(height, current_round);
                        }
                    }
                }
            }
            VoteType::Precommit => {
                let round = vote.round;
                let (maj23, any) = {
                    let precommits = self.rs.votes.precommits(round);
                    (
                        precommits.two_thirds_majority(),
                        precommits.has_two_thirds_any(),
                    )
                };
                match maj23 {
                    Some(Maj23::Nil) => {
                        // Everyone gave up on this round.
                        self.enter_new_round(height, round + 1);
                    }
                    Some(Maj23::Block(_)) => {
                        self.enter_new_round(height, round);
                        self.enter_precommit(height, round);
                        self.enter_commit(height, round);
                    }
                    None => {
                        if self.rs.round <= round && any {
                            self.enter_new_round(height, round);
                            self.enter_precommit(height, round);
                            self.enter_precommit_wait(height, round);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn broadcast_has_vote(&mut self, vote: &Vote) {
        let msg = ConsensusMessage::HasVote {
            height: vote.height,
            round: vote.round,
            vote_type: vote.vote_type,
            index: vote.validator_index,
        };
        self.broadcast(msg);
    }

    /// Sign a vote and feed it back through the internal queue.
    fn sign_add_vote(&mut self, vote_type: VoteType, block_id: Option<BlockId>) {
        let Some(pv) = self.priv_validator.clone() else {
            return;
        };
        let Some((index, _)) = self.rs.validators.get_by_address(&pv.address()) else {
            // Not in the active set; observers don't vote.
            return;
        };

        let mut vote = Vote {
            height: self.rs.height,
            round: self.rs.round,
            vote_type,
            block_id,
            validator_address: pv.address(),
            validator_index: index,
            timestamp: self.now_ms(),
            signature: Signature::zero(),
        };
        match pv.sign_vote(self.chain_id(), &mut vote) {
            Ok(()) => {
                debug!(%vote, "Signed and pushed vote");
                let msg = ConsensusMessage::Vote {
                    validator_index: index,
                    vote,
                };
                self.broadcast(msg.clone());
                self.send_internal(msg);
            }
            Err(e) => {
                // Refusing to sign (regression/conflict) is the signer doing
                // its job; stall rather than double-sign.
                warn!(height = self.rs.height, round = self.rs.round, error = %e,
                      "Error signing vote");
            }
        }
    }
}

impl StateMachine for ConsensusState {
    fn handle(&mut self, event: Event) -> Vec<Action> {
        match event {
            Event::Message { msg, from } => self.handle_msg(msg, from),
            Event::Timeout(ti) => self.handle_timeout(ti),
        }
        std::mem::take(&mut self.pending)
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
    }
}
