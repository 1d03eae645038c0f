//! Reference applications for tests and local networks.

use crate::{Application, EndBlockResult, TxResult};
use stanchion_types::{Hash, Header, PublicKey, Tx, Validator, ValidatorUpdate};
use std::collections::BTreeMap;
use tracing::debug;

/// A key-value store application.
///
/// Transactions are UTF-8 `key=value` pairs. A transaction of the form
/// `val:<pubkey_hex>:<power>` schedules a validator power change, returned
/// from `end_block`.
#[derive(Default)]
pub struct KvApp {
    committed: BTreeMap<String, String>,
    staged: BTreeMap<String, String>,
    pending_validator_updates: Vec<ValidatorUpdate>,
    /// Indices reported absent in the last `begin_block`, kept for tests.
    pub last_absent: Vec<u32>,
}

impl KvApp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.committed.get(key)
    }

    fn parse_validator_tx(s: &str) -> Option<ValidatorUpdate> {
        let rest = s.strip_prefix("val:")?;
        let (pubkey_hex, power) = rest.split_once(':')?;
        let bytes = hex::decode(pubkey_hex).ok()?;
        if bytes.len() != 32 {
            return None;
        }
        let mut raw = [0u8; 32];
        raw.copy_from_slice(&bytes);
        Some(ValidatorUpdate {
            pub_key: PublicKey::from_raw(raw),
            power: power.parse().ok()?,
        })
    }
}

impl Application for KvApp {
    fn init_chain(&mut self, validators: &[Validator]) {
        debug!(validators = validators.len(), "kv app: init chain");
    }

    fn begin_block(&mut self, _hash: Hash, header: &Header, absent: &[u32]) {
        debug!(height = header.height, absent = ?absent, "kv app: begin block");
        self.last_absent = absent.to_vec();
        self.staged.clear();
        self.pending_validator_updates.clear();
    }

    fn deliver_tx(&mut self, tx: &Tx) -> TxResult {
        let Ok(s) = std::str::from_utf8(&tx.0) else {
            return TxResult::error(1, "tx is not utf-8");
        };
        if let Some(update) = Self::parse_validator_tx(s) {
            self.pending_validator_updates.push(update);
            return TxResult::ok(Vec::new());
        }
        match s.split_once('=') {
            Some((key, value)) => {
                self.staged.insert(key.to_string(), value.to_string());
                TxResult::ok(value.as_bytes().to_vec())
            }
            None => TxResult::error(1, "expected key=value"),
        }
    }

    fn end_block(&mut self, _height: u64) -> EndBlockResult {
        EndBlockResult {
            validator_updates: std::mem::take(&mut self.pending_validator_updates),
            consensus_params_update: None,
        }
    }

    fn commit(&mut self) -> Hash {
        self.committed.extend(std::mem::take(&mut self.staged));
        let bytes = bincode::serialize(&self.committed)
            .expect("kv state encoding must succeed - this is a bug if it fails");
        Hash::from_bytes(&bytes)
    }
}

/// A strictly sequential counter.
///
/// Each transaction must be the 8-byte big-endian encoding of the next
/// counter value, starting from 0.
#[derive(Default)]
pub struct CounterApp {
    committed: u64,
    staged: u64,
}

impl CounterApp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> u64 {
        self.committed
    }
}

impl Application for CounterApp {
    fn init_chain(&mut self, _validators: &[Validator]) {}

    fn begin_block(&mut self, _hash: Hash, _header: &Header, _absent: &[u32]) {
        self.staged = self.committed;
    }

    fn deliver_tx(&mut self, tx: &Tx) -> TxResult {
        let Ok(bytes) = <[u8; 8]>::try_from(tx.0.as_slice()) else {
            return TxResult::error(1, "counter tx must be 8 bytes");
        };
        let value = u64::from_be_bytes(bytes);
        if value != self.staged {
            return TxResult::error(2, format!("expected {}, got {}", self.staged, value));
        }
        self.staged += 1;
        TxResult::ok(Vec::new())
    }

    fn end_block(&mut self, _height: u64) -> EndBlockResult {
        EndBlockResult::default()
    }

    fn commit(&mut self) -> Hash {
        self.committed = self.staged;
        Hash::from_bytes(&self.committed.to_be_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stanchion_types::test_utils::test_keypair;

    #[test]
    fn kv_app_sets_and_commits() {
        let mut app = KvApp::new();
        let result = app.deliver_tx(&Tx(b"name=satoshi".to_vec()));
        assert!(result.is_ok());
        let h1 = app.commit();
        assert_eq!(app.get("name"), Some(&"satoshi".to_string()));

        // A different write produces a different app hash.
        app.deliver_tx(&Tx(b"name=other".to_vec()));
        let h2 = app.commit();
        assert_ne!(h1, h2);
    }

    #[test]
    fn kv_app_rejects_malformed_tx() {
        let mut app = KvApp::new();
        assert!(!app.deliver_tx(&Tx(b"no-equals".to_vec())).is_ok());
        assert!(!app.deliver_tx(&Tx(vec![0xff, 0xfe])).is_ok());
    }

    #[test]
    fn kv_app_emits_validator_updates() {
        let mut app = KvApp::new();
        let key = test_keypair(9);
        let tx = format!("val:{}:25", hex::encode(key.public_key().as_bytes()));
        assert!(app.deliver_tx(&Tx(tx.into_bytes())).is_ok());
        let end = app.end_block(1);
        assert_eq!(end.validator_updates.len(), 1);
        assert_eq!(end.validator_updates[0].power, 25);
    }

    #[test]
    fn counter_app_requires_sequence() {
        let mut app = CounterApp::new();
        assert!(app.deliver_tx(&Tx(0u64.to_be_bytes().to_vec())).is_ok());
        assert!(app.deliver_tx(&Tx(1u64.to_be_bytes().to_vec())).is_ok());
        assert!(!app.deliver_tx(&Tx(5u64.to_be_bytes().to_vec())).is_ok());
        app.commit();
        assert_eq!(app.count(), 2);
    }
}
