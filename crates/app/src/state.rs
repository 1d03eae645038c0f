//! Committed chain state and its persistence schema.

use crate::store::KvStore;
use crate::{AppResponses, TxResultSet};
use serde::{Deserialize, Serialize};
use stanchion_types::{BlockId, ConsensusParams, Hash, ValidatorSet};
use std::sync::Arc;

/// The state of the chain after the last committed block.
///
/// Three validator sets are tracked so that changes returned by the
/// application at height H only take effect at H+2: the intervening block's
/// header still commits to the old set, which is what keeps light-client
/// verification chains intact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainState {
    pub chain_id: String,
    /// Height of the last committed block; 0 before the first commit.
    pub last_block_height: u64,
    pub last_block_id: BlockId,
    /// Time of the last committed block, milliseconds since epoch.
    pub last_block_time: u64,
    /// Validators for height `last_block_height + 1`.
    pub validators: ValidatorSet,
    /// Validators that committed the block at `last_block_height`.
    pub last_validators: ValidatorSet,
    /// Validators for height `last_block_height + 2`; application updates
    /// land here.
    pub next_validators: ValidatorSet,
    /// Consensus parameters for height `last_block_height + 1`.
    pub consensus_params: ConsensusParams,
    /// Parameters for `last_block_height + 2`.
    pub next_consensus_params: ConsensusParams,
    /// Application hash after executing the last committed block.
    pub last_app_hash: Hash,
    /// Root of the transaction results from the last committed block.
    pub last_results_hash: Hash,
}

impl ChainState {
    /// Genesis state: no blocks committed, the given validators active.
    pub fn from_genesis(
        chain_id: impl Into<String>,
        validators: ValidatorSet,
        consensus_params: ConsensusParams,
    ) -> Self {
        let mut next_validators = validators.clone();
        next_validators.increment_accum(1);
        ChainState {
            chain_id: chain_id.into(),
            last_block_height: 0,
            last_block_id: BlockId::zero(),
            last_block_time: 0,
            last_validators: ValidatorSet::new(Vec::new()),
            next_validators,
            validators,
            next_consensus_params: consensus_params.clone(),
            consensus_params,
            last_app_hash: Hash::ZERO,
            last_results_hash: Hash::ZERO,
        }
    }
}

// Persistence schema keys.
const STATE_KEY: &[u8] = b"stateKey";
const APP_RESPONSES_KEY: &[u8] = b"abciResponsesKey";

fn validators_key(height: u64) -> Vec<u8> {
    format!("validatorsKey:{}", height).into_bytes()
}

fn consensus_params_key(height: u64) -> Vec<u8> {
    format!("consensusParamsKey:{}", height).into_bytes()
}

fn results_key(height: u64) -> Vec<u8> {
    format!("resultsKey:{}", height).into_bytes()
}

/// Chain state persistence over a [`KvStore`].
///
/// Besides the latest state, historical validator sets, consensus params, and
/// transaction results are kept per height for catching-up peers and light
/// clients.
#[derive(Clone)]
pub struct StateStore {
    kv: Arc<dyn KvStore>,
}

impl StateStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        StateStore { kv }
    }

    /// Persist `state` durably, together with the validator set and params
    /// that will be active at `state.last_block_height + 2`.
    ///
    /// # Panics
    ///
    /// Panics on encoding failure. Losing committed state is unrecoverable;
    /// the caller treats any failure here as fatal.
    pub fn save(&self, state: &ChainState) {
        let next_height = state.last_block_height + 2;
        self.kv.put(
            &validators_key(next_height),
            &encode(&state.next_validators),
        );
        self.kv.put(
            &consensus_params_key(next_height),
            &encode(&state.next_consensus_params),
        );
        self.kv.put_sync(STATE_KEY, &encode(state));
    }

    pub fn load(&self) -> Option<ChainState> {
        self.kv.get(STATE_KEY).and_then(|bytes| decode(&bytes))
    }

    /// Persist the application responses for the block being committed.
    ///
    /// Written before the application's `commit()` is issued, so a crash
    /// between `commit` and the state save can be recovered by replaying the
    /// saved responses rather than the transactions.
    pub fn save_responses(&self, height: u64, responses: &AppResponses) {
        self.kv.put(&results_key(height), &encode(&responses.results()));
        self.kv.put_sync(APP_RESPONSES_KEY, &encode(responses));
    }

    pub fn load_responses(&self) -> Option<AppResponses> {
        self.kv.get(APP_RESPONSES_KEY).and_then(|b| decode(&b))
    }

    pub fn load_results(&self, height: u64) -> Option<TxResultSet> {
        self.kv.get(&results_key(height)).and_then(|b| decode(&b))
    }

    pub fn load_validators(&self, height: u64) -> Option<ValidatorSet> {
        self.kv.get(&validators_key(height)).and_then(|b| decode(&b))
    }

    pub fn load_consensus_params(&self, height: u64) -> Option<ConsensusParams> {
        self.kv
            .get(&consensus_params_key(height))
            .and_then(|b| decode(&b))
    }

    /// Persist the validator set and params for the two heights after
    /// genesis, which `save` would otherwise never write.
    pub fn save_genesis_schema(&self, state: &ChainState) {
        self.kv.put(&validators_key(1), &encode(&state.validators));
        self.kv
            .put(&consensus_params_key(1), &encode(&state.consensus_params));
        self.kv.put(
            &validators_key(2),
            &encode(&state.next_validators),
        );
        self.kv.put(
            &consensus_params_key(2),
            &encode(&state.next_consensus_params),
        );
    }
}

fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    bincode::serialize(value).expect("state encoding must succeed - this is a bug if it fails")
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Option<T> {
    match bincode::deserialize(bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::error!("Failed to decode persisted state: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemKvStore;
    use stanchion_types::test_utils::test_validator_set;

    #[test]
    fn state_roundtrips_through_store() {
        let (validators, _) = test_validator_set(4, 10);
        let state = ChainState::from_genesis("test-chain", validators, ConsensusParams::default());
        let store = StateStore::new(Arc::new(MemKvStore::new()));
        assert!(store.load().is_none());
        store.save(&state);
        assert_eq!(store.load().unwrap(), state);
    }

    #[test]
    fn save_writes_plus_two_schema_entries() {
        let (validators, _) = test_validator_set(4, 10);
        let mut state =
            ChainState::from_genesis("test-chain", validators, ConsensusParams::default());
        state.last_block_height = 5;
        let store = StateStore::new(Arc::new(MemKvStore::new()));
        store.save(&state);
        assert_eq!(store.load_validators(7), Some(state.next_validators.clone()));
        assert_eq!(
            store.load_consensus_params(7),
            Some(state.next_consensus_params.clone())
        );
        assert!(store.load_validators(6).is_none());
    }
}
