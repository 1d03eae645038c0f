//! BFT consensus state machine with write-ahead-log crash recovery.
//!
//! This crate provides the per-height consensus engine:
//!
//! - [`ConsensusState`]: the propose → prevote → precommit → commit machine,
//!   with its locking rules and round-skipping
//! - [`VoteSet`] / [`HeightVoteSet`]: vote accounting with 2/3-any and
//!   2/3-one thresholds and conflicting-signature detection
//! - [`Wal`] and [`replay`]: the write-ahead log and deterministic replay
//!   used for crash recovery
//!
//! # Architecture
//!
//! The machine is synchronous and sans-I/O: events in, actions out (see
//! `stanchion-core`). The only blocking calls a
//! handler makes are signer persistence and, at commit, application
//! execution — both behind injected traits. Locally signed proposals, parts,
//! and votes are returned as `EnqueueInternal` actions and re-enter through
//! the same queue as peer messages, so the event loop is the single writer
//! of round state.
//!
//! The runner must append every consumed event to the WAL *before* handing
//! it to [`ConsensusState::handle`]; on restart, [`replay::catchup`] drives
//! the machine through the tail of the log to reconstruct exactly the state
//! at the crash.

mod config;
mod height_vote_set;
pub mod replay;
mod round_state;
mod state;
mod vote_set;
mod wal;

pub use config::ConsensusConfig;
pub use height_vote_set::HeightVoteSet;
pub use round_state::RoundState;
pub use state::ConsensusState;
pub use vote_set::{AddVoteOutcome, Maj23, VoteSet, VoteSetError};
pub use wal::{TimedWalMessage, Wal, WalMessage};

use parking_lot::Mutex;
use stanchion_types::{BlockError, PartSetError, Tx};

/// Errors from processing consensus messages.
#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("invalid proposal signature")]
    InvalidProposalSignature,
    #[error("invalid proposal POL round")]
    InvalidProposalPolRound,
    #[error("vote height mismatch: expected {expected}, got {got}")]
    VoteHeightMismatch { expected: u64, got: u64 },
    #[error("error adding vote: {0}")]
    AddingVote(#[from] VoteSetError),
    #[error("error adding block part: {0}")]
    Part(#[from] PartSetError),
    #[error("error decoding proposal block: {0}")]
    Block(#[from] BlockError),
}

/// Where the proposer gets transactions from.
///
/// The mempool proper is an external collaborator; consensus only needs to
/// reap transactions for a new proposal and to drop the ones a committed
/// block consumed.
pub trait TxSource: Send + Sync {
    /// Up to `max_txs` transactions for the next proposal, in order.
    fn reap(&self, max_txs: usize) -> Vec<Tx>;

    /// A block committed at `height`; drop its transactions.
    fn update(&self, height: u64, committed: &[Tx]);
}

/// A FIFO transaction queue, sufficient for tests and local networks.
#[derive(Default)]
pub struct FifoMempool {
    txs: Mutex<Vec<Tx>>,
}

impl FifoMempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, tx: Tx) {
        self.txs.lock().push(tx);
    }

    pub fn len(&self) -> usize {
        self.txs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.lock().is_empty()
    }
}

impl TxSource for FifoMempool {
    fn reap(&self, max_txs: usize) -> Vec<Tx> {
        let txs = self.txs.lock();
        txs.iter().take(max_txs).cloned().collect()
    }

    fn update(&self, _height: u64, committed: &[Tx]) {
        let mut txs = self.txs.lock();
        txs.retain(|tx| !committed.contains(tx));
    }
}
