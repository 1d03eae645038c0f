//! Block validation and the state transition driver.

use crate::state::{ChainState, StateStore};
use crate::{AppResponses, Application};
use stanchion_types::{Block, BlockError, BlockId, CommitError};
use tracing::{debug, info, warn};

/// Errors from validating or applying a block.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error("invalid last commit: {0}")]
    Commit(#[from] CommitError),
    #[error("validators hash mismatch")]
    ValidatorsHashMismatch,
    #[error("consensus params hash mismatch")]
    ConsensusHashMismatch,
    #[error("app hash mismatch")]
    AppHashMismatch,
    #[error("results hash mismatch")]
    ResultsHashMismatch,
    #[error("too many txs: {got} > {max}")]
    TooManyTxs { got: usize, max: usize },
}

/// Drives the application through block execution and owns the resulting
/// state transitions.
///
/// Validation (used at prevote/precommit time) checks a proposed block
/// against committed state without touching the application. Execution runs
/// exactly once, when the block commits.
pub struct BlockExecutor {
    app: Box<dyn Application>,
    state_store: StateStore,
}

impl BlockExecutor {
    pub fn new(app: Box<dyn Application>, state_store: StateStore) -> Self {
        BlockExecutor { app, state_store }
    }

    /// Genesis bootstrap: hand the application its initial validator set and
    /// persist the genesis state schema.
    pub fn init_chain(&mut self, state: &ChainState) {
        self.app.init_chain(state.validators.validators());
        self.state_store.save_genesis_schema(state);
        self.state_store.save(state);
        info!(
            chain_id = %state.chain_id,
            validators = state.validators.len(),
            "Initialized chain"
        );
    }

    /// Validate a proposed block against the committed state.
    pub fn validate_block(&self, state: &ChainState, block: &Block) -> Result<(), ExecutionError> {
        block.validate_basic(&state.chain_id, state.last_block_height, state.last_block_id)?;

        if block.data.len() > state.consensus_params.max_block_txs {
            return Err(ExecutionError::TooManyTxs {
                got: block.data.len(),
                max: state.consensus_params.max_block_txs,
            });
        }
        if block.header.validators_hash != state.validators.hash() {
            return Err(ExecutionError::ValidatorsHashMismatch);
        }
        if block.header.consensus_hash != state.consensus_params.hash() {
            return Err(ExecutionError::ConsensusHashMismatch);
        }
        if block.header.app_hash != state.last_app_hash {
            return Err(ExecutionError::AppHashMismatch);
        }
        if block.header.results_hash != state.last_results_hash {
            return Err(ExecutionError::ResultsHashMismatch);
        }
        if block.header.height > 1 {
            state.last_validators.verify_commit(
                &state.chain_id,
                block.header.last_block_id,
                block.header.height - 1,
                &block.last_commit,
            )?;
        }
        Ok(())
    }

    /// Execute a committed block against the application and produce the next
    /// chain state.
    ///
    /// Order matters for crash recovery: the application responses are
    /// persisted *before* `commit()` is issued, and the new state is saved
    /// only after. Validator and parameter updates returned here take effect
    /// two heights later.
    pub fn apply_block(
        &mut self,
        state: &ChainState,
        block_id: BlockId,
        block: &Block,
    ) -> Result<ChainState, ExecutionError> {
        self.validate_block(state, block)?;

        let height = block.height();
        let absent = block.last_commit.absent_indices();
        if !absent.is_empty() {
            debug!(height, absent = ?absent, "Validators absent from last commit");
        }

        self.app.begin_block(block.hash(), &block.header, &absent);

        let mut deliver_txs = Vec::with_capacity(block.data.len());
        let mut invalid = 0usize;
        for tx in &block.data {
            let result = self.app.deliver_tx(tx);
            if !result.is_ok() {
                invalid += 1;
            }
            deliver_txs.push(result);
        }
        if invalid > 0 {
            warn!(height, invalid, total = block.data.len(), "Block contained invalid txs");
        }

        let end_block = self.app.end_block(height);
        let responses = AppResponses {
            height,
            deliver_txs,
            end_block: end_block.clone(),
        };
        self.state_store.save_responses(height, &responses);

        let app_hash = self.app.commit();

        let next_state = apply_transition(state, block_id, block, &responses, app_hash);
        self.state_store.save(&next_state);

        info!(
            height,
            txs = block.data.len(),
            app_hash = %app_hash,
            validator_updates = end_block.validator_updates.len(),
            "Applied block"
        );
        Ok(next_state)
    }

    /// Re-apply blocks the block store holds beyond the persisted state.
    ///
    /// Covers a crash between saving a block and saving the state it
    /// produced: execution is deterministic, so re-running yields the same
    /// app hash.
    pub fn replay_stored_blocks(
        &mut self,
        mut state: ChainState,
        block_store: &dyn crate::BlockStore,
    ) -> Result<ChainState, ExecutionError> {
        while block_store.height() > state.last_block_height {
            let height = state.last_block_height + 1;
            let Some(block) = block_store.load_block(height) else {
                break;
            };
            let Some(seen_commit) = block_store.load_seen_commit(height) else {
                break;
            };
            info!(height, "Replaying stored block into application");
            state = self.apply_block(&state, seen_commit.block_id, &block)?;
        }
        Ok(state)
    }
}

/// Pure state transition: block H committed, responses in hand.
fn apply_transition(
    state: &ChainState,
    block_id: BlockId,
    block: &Block,
    responses: &AppResponses,
    app_hash: stanchion_types::Hash,
) -> ChainState {
    // Updates returned at height H land in the set for H+2. The set for H+1
    // was fixed when block H-1 committed.
    let mut next_validators = state.next_validators.clone();
    next_validators.apply_updates(&responses.end_block.validator_updates);
    next_validators.increment_accum(1);

    let next_consensus_params = match &responses.end_block.consensus_params_update {
        Some(update) => state.next_consensus_params.apply_update(update),
        None => state.next_consensus_params.clone(),
    };

    ChainState {
        chain_id: state.chain_id.clone(),
        last_block_height: block.height(),
        last_block_id: block_id,
        last_block_time: block.header.time,
        last_validators: state.validators.clone(),
        validators: state.next_validators.clone(),
        next_validators,
        consensus_params: state.next_consensus_params.clone(),
        next_consensus_params,
        last_app_hash: app_hash,
        last_results_hash: responses.results_hash(),
    }
}
