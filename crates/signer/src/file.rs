//! File-backed validator signer.

use crate::info::{HrsCheck, LastSignedInfo, SignStep};
use crate::{PrivValidator, SignerError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use stanchion_types::{
    heartbeat_sign_bytes, proposal_sign_bytes, vote_sign_bytes, Address, Heartbeat, KeyPair,
    Proposal, PublicKey, Signature, Vote,
};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Validator identity stored alongside the signing state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorId {
    pub address: Address,
    pub pub_key: PublicKey,
}

#[derive(Serialize, Deserialize)]
struct FileContents {
    id: ValidatorId,
    info: LastSignedInfo,
    signer: SignerKey,
}

#[derive(Serialize, Deserialize)]
struct SignerKey {
    priv_key: KeyPair,
}

struct Guarded {
    info: LastSignedInfo,
}

/// A [`PrivValidator`] backed by a JSON file.
///
/// The last signed (height, round, step, sign-bytes, signature) is written
/// atomically (temp file + fsync + rename, mode 0600) before any signature
/// leaves this struct. A crash between signing and persisting therefore
/// cannot lead to a conflicting signature after restart: either the write
/// completed and the restarted signer replays the identical signature, or it
/// did not and the signature was never released.
pub struct FilePrivValidator {
    id: ValidatorId,
    key: KeyPair,
    path: PathBuf,
    guarded: Mutex<Guarded>,
}

impl FilePrivValidator {
    /// Load the signer from `path`, or generate a fresh key and save it.
    pub fn load_or_generate(path: impl AsRef<Path>) -> Result<Self, SignerError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            let pv = Self::generate(path, KeyPair::generate());
            pv.save();
            info!(path = %path.display(), address = %pv.id.address, "Generated new priv validator");
            Ok(pv)
        }
    }

    /// Build a signer from an existing key, without touching disk yet.
    pub fn generate(path: impl AsRef<Path>, key: KeyPair) -> Self {
        let id = ValidatorId {
            address: key.address(),
            pub_key: key.public_key(),
        };
        FilePrivValidator {
            id,
            key,
            path: path.as_ref().to_path_buf(),
            guarded: Mutex::new(Guarded {
                info: LastSignedInfo::default(),
            }),
        }
    }

    /// Load the signer state from `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SignerError> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|e| SignerError::Io(e.to_string()))?;
        let contents: FileContents =
            serde_json::from_slice(&bytes).map_err(|e| SignerError::Corrupt(e.to_string()))?;
        debug!(
            path = %path.display(),
            last_height = contents.info.last_height,
            last_round = contents.info.last_round,
            "Loaded priv validator"
        );
        Ok(FilePrivValidator {
            id: contents.id,
            key: contents.signer.priv_key,
            path: path.to_path_buf(),
            guarded: Mutex::new(Guarded {
                info: contents.info,
            }),
        })
    }

    /// Persist the current state.
    ///
    /// # Panics
    ///
    /// Panics on any I/O failure. A signature must never be released without
    /// a durable record of it; crashing is the only safe response here.
    fn save_locked(&self, guarded: &Guarded) {
        let contents = FileContents {
            id: self.id.clone(),
            info: guarded.info.clone(),
            signer: SignerKey {
                priv_key: self.key.clone(),
            },
        };
        let json = serde_json::to_vec_pretty(&contents)
            .expect("priv validator encoding must succeed - this is a bug if it fails");
        write_file_atomic(&self.path, &json)
            .expect("SAFETY CRITICAL: priv validator persistence failed - cannot sign safely");
    }

    fn save(&self) {
        let guarded = self.guarded.lock();
        self.save_locked(&guarded);
    }

    /// The signing guard: check HRS, sign, persist, release.
    fn sign_hrs(
        &self,
        height: u64,
        round: u32,
        step: SignStep,
        sign_bytes: &[u8],
    ) -> Result<Signature, SignerError> {
        let mut guarded = self.guarded.lock();
        match guarded.info.check_hrs(height, round, step, sign_bytes)? {
            HrsCheck::Cached(sig) => {
                debug!(height, round, ?step, "Reusing recorded signature");
                Ok(sig)
            }
            HrsCheck::Advance => {
                let signature = self.key.sign(sign_bytes);
                guarded
                    .info
                    .record(height, round, step, sign_bytes.to_vec(), signature);
                // Persist before the signature escapes the lock.
                self.save_locked(&guarded);
                Ok(signature)
            }
        }
    }
}

impl PrivValidator for FilePrivValidator {
    fn address(&self) -> Address {
        self.id.address
    }

    fn pub_key(&self) -> PublicKey {
        self.id.pub_key
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
        // Heartbeats carry no consensus weight; no HRS guard needed.
        heartbeat.signature = self.key.sign(&heartbeat_sign_bytes(chain_id, heartbeat));
        Ok(())
    }
}

/// Write `bytes` to `path` atomically: temp file in the same directory,
/// fsync, rename over the target. File mode 0600.
fn write_file_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp_path = dir.join(format!(
        ".{}.tmp",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "priv_validator".into())
    ));

    {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(0o600))?;
        }
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stanchion_types::{BlockId, Hash, PartSetHeader, VoteType};
    use tempfile::TempDir;

    fn test_vote(height: u64, round: u32, block_hash: &[u8]) -> Vote {
        Vote {
            height,
            round,
            vote_type: VoteType::Prevote,
            block_id: Some(BlockId {
                hash: Hash::from_bytes(block_hash),
                parts: PartSetHeader::zero(),
            }),
            validator_address: Address::from_raw([0; 20]),
            validator_index: 0,
            timestamp: 100,
            signature: Signature::zero(),
        }
    }

    #[test]
    fn sign_vote_produces_verifiable_signature() {
        let dir = TempDir::new().unwrap();
        let pv = FilePrivValidator::load_or_generate(dir.path().join("pv.json")).unwrap();
        let mut vote = test_vote(1, 0, b"block");
        pv.sign_vote("chain", &mut vote).unwrap();
        let bytes = vote_sign_bytes("chain", &vote);
        assert!(pv.pub_key().verify(&bytes, &vote.signature));
    }

    #[test]
    fn refuses_conflicting_vote_at_same_hrs() {
        let dir = TempDir::new().unwrap();
        let pv = FilePrivValidator::load_or_generate(dir.path().join("pv.json")).unwrap();
        let mut vote_a = test_vote(5, 0, b"block-a");
        pv.sign_vote("chain", &mut vote_a).unwrap();

        let mut vote_b = test_vote(5, 0, b"block-b");
        assert!(matches!(
            pv.sign_vote("chain", &mut vote_b),
            Err(SignerError::Conflict)
        ));
    }

    #[test]
    fn identical_vote_is_re_signed_idempotently() {
        let dir = TempDir::new().unwrap();
        let pv = FilePrivValidator::load_or_generate(dir.path().join("pv.json")).unwrap();
        let mut vote = test_vote(5, 0, b"block");
        pv.sign_vote("chain", &mut vote).unwrap();
        let first = vote.signature;

        let mut again = test_vote(5, 0, b"block");
        pv.sign_vote("chain", &mut again).unwrap();
        assert_eq!(first, again.signature);
    }

    #[test]
    fn guard_survives_restart() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pv.json");
        let first_sig;
        {
            let pv = FilePrivValidator::load_or_generate(&path).unwrap();
            let mut vote = test_vote(7, 2, b"block");
            pv.sign_vote("chain", &mut vote).unwrap();
            first_sig = vote.signature;
        }

        // Reload, as after a crash.
        let pv = FilePrivValidator::load(&path).unwrap();

        // Identical payload: same signature back.
        let mut same = test_vote(7, 2, b"block");
        pv.sign_vote("chain", &mut same).unwrap();
        assert_eq!(same.signature, first_sig);

        // Conflicting payload at the same HRS: refused.
        let mut conflicting = test_vote(7, 2, b"other");
        assert!(pv.sign_vote("chain", &mut conflicting).is_err());

        // Regression: refused.
        let mut old = test_vote(6, 0, b"older");
        assert!(matches!(
            pv.sign_vote("chain", &mut old),
            Err(SignerError::HeightRegression { .. })
        ));
    }

    #[test]
    fn proposal_then_prevote_then_precommit_in_one_round() {
        let dir = TempDir::new().unwrap();
        let pv = FilePrivValidator::load_or_generate(dir.path().join("pv.json")).unwrap();

        let mut proposal = Proposal::new(3, 0, PartSetHeader::zero(), -1, 50);
        pv.sign_proposal("chain", &mut proposal).unwrap();

        let mut prevote = test_vote(3, 0, b"block");
        pv.sign_vote("chain", &mut prevote).unwrap();

        let mut precommit = test_vote(3, 0, b"block");
        precommit.vote_type = VoteType::Precommit;
        pv.sign_vote("chain", &mut precommit).unwrap();

        // Going back to propose for the same round must now fail.
        let mut late_proposal = Proposal::new(3, 0, PartSetHeader::zero(), -1, 60);
        assert!(matches!(
            pv.sign_proposal("chain", &mut late_proposal),
            Err(SignerError::StepRegression { .. })
        ));
    }

    #[test]
    fn file_mode_is_0600() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("pv.json");
            let _pv = FilePrivValidator::load_or_generate(&path).unwrap();
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
