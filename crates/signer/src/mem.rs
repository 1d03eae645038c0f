//! In-memory signer for unit tests.

use crate::info::{HrsCheck, LastSignedInfo, SignStep};
use crate::{PrivValidator, SignerError};
use parking_lot::Mutex;
use stanchion_types::{
    heartbeat_sign_bytes, proposal_sign_bytes, vote_sign_bytes, Address, Heartbeat, KeyPair,
    Proposal, PublicKey, Signature, Vote,
};

/// A [`PrivValidator`] with the same guard semantics as the file signer but
/// no persistence. It forgets everything on drop, so it must not back a real
/// validator.
pub struct MemPrivValidator {
    key: KeyPair,
    info: Mutex<LastSignedInfo>,
}

impl MemPrivValidator {
    pub fn new(key: KeyPair) -> Self {
        MemPrivValidator {
            key,
            info: Mutex::new(LastSignedInfo::default()),
        }
    }

    fn sign_hrs(
        &self,
        height: u64,
        round: u32,
        step: SignStep,
        sign_bytes: &[u8],
    ) -> Result<Signature, SignerError> {
        let mut info = self.info.lock();
        match info.check_hrs(height, round, step, sign_bytes)? {
            HrsCheck::Cached(sig) => Ok(sig),
            HrsCheck::Advance => {
                let signature = self.key.sign(sign_bytes);
                info.record(height, round, step, sign_bytes.to_vec(), signature);
                Ok(signature)
            }
        }
    }
}

impl PrivValidator for MemPrivValidator {
    fn address(&self) -> Address {
        self.key.address()
    }

    fn pub_key(&self) -> PublicKey {
        self.key.public_key()
    }

    fn sign_vote(&self, chain_id: &str, vote: &mut Vote) -> Result<(), SignerError> {
        let sign_bytes = vote_sign_bytes(chain_id, vote);
        let step = SignStep::for_vote(vote.vote_type);
        vote.signature = self.sign_hrs(vote.height, vote.round, step, &sign_bytes)?;
        Ok(())
    }

    fn sign_proposal(&self, chain_id: &str, proposal: &mut Proposal) -> Result<(), SignerError> {
        let sign_bytes = proposal_sign_bytes(chain_id, proposal);
        proposal.signature = self.sign_hrs(
            proposal.height,
            proposal.round,
            SignStep::Propose,
            &sign_bytes,
        )?;
        Ok(())
    }

    fn sign_heartbeat(&self, chain_id: &str, heartbeat: &mut Heartbeat) -> Result<(), SignerError> {
        heartbeat.signature = self.key.sign(&heartbeat_sign_bytes(chain_id, heartbeat));
        Ok(())
    }
}
