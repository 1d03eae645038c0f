//! Double-signing-safe validator signer.
//!
//! A validator must never produce two different signatures for the same
//! (height, round, step). This crate enforces that with a monotonic guard
//! persisted to disk *before* any signature is released:
//!
//! - A request older than the last signed triple fails with a regression
//!   error.
//! - A request for the same triple with identical sign-bytes returns the
//!   recorded signature (idempotent rebroadcast, used by WAL replay).
//! - A request for the same triple with different sign-bytes fails with
//!   [`SignerError::Conflict`].
//! - A newer request signs, persists the new state atomically, then returns.
//!
//! Persistence failure is fatal by design: returning an unrecorded signature
//! would allow a conflicting signature after restart.

mod file;
mod info;
mod mem;

pub use file::{FilePrivValidator, ValidatorId};
pub use info::{HrsCheck, LastSignedInfo, SignStep};
pub use mem::MemPrivValidator;

use stanchion_types::{Address, Heartbeat, Proposal, PublicKey, Vote};

/// Errors from the signing guard.
#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("height regression: last signed {last}, got {got}")]
    HeightRegression { last: u64, got: u64 },
    #[error("round regression: last signed {last}, got {got}")]
    RoundRegression { last: u32, got: u32 },
    #[error("step regression: last signed {last:?}, got {got:?}")]
    StepRegression { last: SignStep, got: SignStep },
    #[error("conflicting sign bytes at the last signed height/round/step")]
    Conflict,
    #[error("signer io error: {0}")]
    Io(String),
    #[error("signer state corrupt: {0}")]
    Corrupt(String),
}

/// A local validator that signs votes, proposals, and heartbeats, and never
/// double-signs.
pub trait PrivValidator: Send + Sync {
    fn address(&self) -> Address;
    fn pub_key(&self) -> PublicKey;

    /// Sign the vote's canonical bytes, filling in `vote.signature`.
    fn sign_vote(&self, chain_id: &str, vote: &mut Vote) -> Result<(), SignerError>;

    /// Sign the proposal's canonical bytes, filling in `proposal.signature`.
    fn sign_proposal(&self, chain_id: &str, proposal: &mut Proposal) -> Result<(), SignerError>;

    /// Sign a heartbeat. Heartbeats are not guarded: they carry no consensus
    /// weight.
    fn sign_heartbeat(&self, chain_id: &str, heartbeat: &mut Heartbeat) -> Result<(), SignerError>;
}
