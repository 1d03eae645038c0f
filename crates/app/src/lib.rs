//! Application boundary and state transition driver.
//!
//! Consensus treats the application as an opaque connection with
//! deterministic replies:
//!
//! ```text
//! init_chain → (begin_block → deliver_tx* → end_block → commit)*
//! ```
//!
//! [`BlockExecutor`] drives that sequence when a block commits, records the
//! responses, and applies the resulting [`ChainState`] transition. Validator
//! and consensus-parameter changes returned by `end_block(H)` take effect at
//! height H+2, which keeps the intervening header verifiable by light
//! clients.

mod executor;
mod state;
mod store;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use executor::{BlockExecutor, ExecutionError};
pub use state::{ChainState, StateStore};
pub use store::{BlockStore, KvStore, MemBlockStore, MemKvStore};

use serde::{Deserialize, Serialize};
use stanchion_types::{
    merkle_root, ConsensusParamsUpdate, Hash, Header, Tx, Validator, ValidatorUpdate,
};

/// Result of delivering one transaction. Code 0 is success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxResult {
    pub code: u32,
    pub data: Vec<u8>,
    pub log: String,
    pub tags: Vec<(String, Vec<u8>)>,
}

impl TxResult {
    pub fn ok(data: Vec<u8>) -> Self {
        TxResult {
            code: 0,
            data,
            ..Default::default()
        }
    }

    pub fn error(code: u32, log: impl Into<String>) -> Self {
        TxResult {
            code,
            log: log.into(),
            ..Default::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == 0
    }

    fn hash(&self) -> Hash {
        let bytes = bincode::serialize(&(self.code, &self.data))
            .expect("tx result encoding must succeed - this is a bug if it fails");
        Hash::from_bytes(&bytes)
    }
}

/// The deterministic portion of a set of transaction results, as committed
/// into the next header's `results_hash`.
pub type TxResultSet = Vec<TxResult>;

/// Result of ending a block: deferred membership and parameter changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndBlockResult {
    pub validator_updates: Vec<ValidatorUpdate>,
    pub consensus_params_update: Option<ConsensusParamsUpdate>,
}

/// Everything the application replied while executing one block. Persisted
/// before the application's `commit()` is issued so a crash in between can be
/// recovered from the responses instead of re-running the transactions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppResponses {
    pub height: u64,
    pub deliver_txs: Vec<TxResult>,
    pub end_block: EndBlockResult,
}

impl AppResponses {
    pub fn results(&self) -> TxResultSet {
        self.deliver_txs.clone()
    }

    /// Merkle root of the deterministic result fields, committed into the
    /// next block's header.
    pub fn results_hash(&self) -> Hash {
        let leaves: Vec<Hash> = self.deliver_txs.iter().map(|r| r.hash()).collect();
        merkle_root(&leaves)
    }
}

/// The application connection.
///
/// All replies must be deterministic functions of the call sequence: every
/// honest validator drives its application with the same blocks in the same
/// order and must arrive at the same `app_hash`.
pub trait Application: Send {
    /// Called once at genesis with the initial validator set.
    fn init_chain(&mut self, validators: &[Validator]);

    /// Begin executing a block. `absent` lists the validator indices whose
    /// precommit is missing from the block's last commit.
    fn begin_block(&mut self, hash: Hash, header: &Header, absent: &[u32]);

    /// Execute one transaction, in block order.
    fn deliver_tx(&mut self, tx: &Tx) -> TxResult;

    /// Finish the block. Returned updates take effect at `height + 2`.
    fn end_block(&mut self, height: u64) -> EndBlockResult;

    /// Persist application state, returning the new app hash.
    fn commit(&mut self) -> Hash;
}
