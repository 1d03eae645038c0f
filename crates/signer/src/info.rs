//! The monotonic height/round/step guard.

use crate::SignerError;
use serde::{Deserialize, Serialize};
use stanchion_types::{Signature, VoteType};

/// Signing step within a round. Strictly ordered: a validator signs at most
/// one payload per (height, round, step), and steps only move forward.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[repr(u8)]
pub enum SignStep {
    /// Initial state, before anything was signed.
    #[default]
    None = 0,
    Propose = 1,
    Prevote = 2,
    Precommit = 3,
}

impl SignStep {
    pub fn for_vote(vote_type: VoteType) -> SignStep {
        match vote_type {
            VoteType::Prevote => SignStep::Prevote,
            VoteType::Precommit => SignStep::Precommit,
        }
    }
}

mod hex_bytes {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, ser: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => ser.serialize_some(&hex::encode(bytes)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Vec<u8>>, D::Error> {
        let opt: Option<String> = Option::deserialize(de)?;
        opt.map(|s| hex::decode(s).map_err(de::Error::custom))
            .transpose()
    }
}

/// The last thing this validator signed. Persisted after every signature so
/// a restarted node can never sign a conflicting payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LastSignedInfo {
    pub last_height: u64,
    pub last_round: u32,
    pub last_step: SignStep,
    /// Kept so an identical payload can be re-signed idempotently after a
    /// crash (the signature is returned from here, not recomputed).
    #[serde(default, with = "hex_bytes")]
    pub last_sign_bytes: Option<Vec<u8>>,
    #[serde(default)]
    pub last_signature: Option<Signature>,
}

/// Outcome of checking a signing request against the guard.
#[derive(Debug)]
pub enum HrsCheck {
    /// Strictly newer (height, round, step): sign and advance the guard.
    Advance,
    /// Same triple, byte-identical payload: reuse the recorded signature.
    Cached(Signature),
}

impl LastSignedInfo {
    /// Check a signing request against the last signed (height, round, step).
    ///
    /// Regressions and same-step conflicts are errors; the caller must not
    /// sign. A byte-identical repeat returns the cached signature so restarts
    /// can rebroadcast without double-signing.
    pub fn check_hrs(
        &self,
        height: u64,
        round: u32,
        step: SignStep,
        sign_bytes: &[u8],
    ) -> Result<HrsCheck, SignerError> {
        if self.last_height > height {
            return Err(SignerError::HeightRegression {
                last: self.last_height,
                got: height,
            });
        }
        if self.last_height == height {
            if self.last_round > round {
                return Err(SignerError::RoundRegression {
                    last: self.last_round,
                    got: round,
                });
            }
            if self.last_round == round {
                if self.last_step > step {
                    return Err(SignerError::StepRegression {
                        last: self.last_step,
                        got: step,
                    });
                }
                if self.last_step == step {
                    match (&self.last_sign_bytes, &self.last_signature) {
                        (Some(bytes), Some(sig)) if bytes.as_slice() == sign_bytes => {
                            return Ok(HrsCheck::Cached(*sig));
                        }
                        (Some(_), None) => panic!(
                            "signer state corrupt: last_sign_bytes present without a signature"
                        ),
                        _ => return Err(SignerError::Conflict),
                    }
                }
            }
        }
        Ok(HrsCheck::Advance)
    }

    /// Record a freshly produced signature. Must be persisted before the
    /// signature is released.
    pub fn record(
        &mut self,
        height: u64,
        round: u32,
        step: SignStep,
        sign_bytes: Vec<u8>,
        signature: Signature,
    ) {
        self.last_height = height;
        self.last_round = round;
        self.last_step = step;
        self.last_sign_bytes = Some(sign_bytes);
        self.last_signature = Some(signature);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stanchion_types::KeyPair;

    fn signed_info(height: u64, round: u32, step: SignStep, bytes: &[u8]) -> LastSignedInfo {
        let kp = KeyPair::from_seed(&[1; 32]);
        let mut info = LastSignedInfo::default();
        info.record(height, round, step, bytes.to_vec(), kp.sign(bytes));
        info
    }

    #[test]
    fn fresh_info_allows_any_sign() {
        let info = LastSignedInfo::default();
        assert!(matches!(
            info.check_hrs(1, 0, SignStep::Propose, b"x"),
            Ok(HrsCheck::Advance)
        ));
    }

    #[test]
    fn height_regression_rejected() {
        let info = signed_info(10, 0, SignStep::Prevote, b"a");
        assert!(matches!(
            info.check_hrs(9, 5, SignStep::Precommit, b"b"),
            Err(SignerError::HeightRegression { .. })
        ));
    }

    #[test]
    fn round_regression_rejected() {
        let info = signed_info(10, 3, SignStep::Prevote, b"a");
        assert!(matches!(
            info.check_hrs(10, 2, SignStep::Precommit, b"b"),
            Err(SignerError::RoundRegression { .. })
        ));
    }

    #[test]
    fn step_regression_rejected() {
        let info = signed_info(10, 3, SignStep::Precommit, b"a");
        assert!(matches!(
            info.check_hrs(10, 3, SignStep::Prevote, b"b"),
            Err(SignerError::StepRegression { .. })
        ));
    }

    #[test]
    fn same_step_different_bytes_is_conflict() {
        let info = signed_info(10, 3, SignStep::Prevote, b"a");
        assert!(matches!(
            info.check_hrs(10, 3, SignStep::Prevote, b"b"),
            Err(SignerError::Conflict)
        ));
    }

    #[test]
    fn same_step_same_bytes_returns_cached_signature() {
        let info = signed_info(10, 3, SignStep::Prevote, b"a");
        let expected = info.last_signature.unwrap();
        match info.check_hrs(10, 3, SignStep::Prevote, b"a") {
            Ok(HrsCheck::Cached(sig)) => assert_eq!(sig, expected),
            other => panic!("expected cached signature, got {:?}", other),
        }
    }

    #[test]
    fn forward_progress_allowed() {
        let info = signed_info(10, 3, SignStep::Prevote, b"a");
        for (h, r, s) in [
            (10, 3, SignStep::Precommit),
            (10, 4, SignStep::Propose),
            (11, 0, SignStep::Propose),
        ] {
            assert!(matches!(
                info.check_hrs(h, r, s, b"b"),
                Ok(HrsCheck::Advance)
            ));
        }
    }
}
