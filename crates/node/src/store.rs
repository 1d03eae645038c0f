//! RocksDB-backed block, state, and evidence storage.
//!
//! All operations are synchronous blocking I/O, called from the consensus
//! loop only during commit finalization. Safety-critical writes use sync
//! writes and panic on failure: continuing past a lost commit would diverge
//! this node from the network.

use crate::metrics;
use rocksdb::{ColumnFamilyDescriptor, Options, WriteBatch, WriteOptions, DB};
use stanchion_app::{BlockStore, KvStore};
use stanchion_types::{Block, Commit, DuplicateVoteEvidence, PartSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::error;

const CF_BLOCKS: &str = "blocks";
const CF_STATE: &str = "state";
const CF_EVIDENCE: &str = "evidence";

const CHAIN_HEIGHT_KEY: &[u8] = b"chain:height";

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),
}

/// RocksDB storage for a validator node.
///
/// Column families:
/// - `blocks`: committed blocks and their seen commits, keyed by height
/// - `state`: the chain-state schema (see `stanchion-app`)
/// - `evidence`: double-sign evidence awaiting handling
pub struct NodeStorage {
    db: Arc<DB>,
}

impl NodeStorage {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors = [CF_BLOCKS, CF_STATE, CF_EVIDENCE]
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(NodeStorage { db: Arc::new(db) })
    }

    fn cf(&self, name: &str) -> &rocksdb::ColumnFamily {
        self.db
            .cf_handle(name)
            .unwrap_or_else(|| panic!("column family {} must exist", name))
    }

    fn block_key(height: u64) -> [u8; 8] {
        height.to_be_bytes()
    }

    fn commit_key(height: u64) -> Vec<u8> {
        let mut key = b"commit:".to_vec();
        key.extend_from_slice(&height.to_be_bytes());
        key
    }

    /// Persist double-sign evidence.
    pub fn put_evidence(&self, evidence: &DuplicateVoteEvidence) {
        let cf = self.cf(CF_EVIDENCE);
        let mut key = evidence.height().to_be_bytes().to_vec();
        key.extend_from_slice(evidence.address().as_bytes());
        key.push(evidence.vote_a.vote_type.as_byte());
        let value = bincode::serialize(evidence)
            .expect("evidence encoding must succeed - this is a bug if it fails");

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db
            .put_cf_opt(cf, key, value, &write_opts)
            .expect("evidence persistence failed - cannot track Byzantine behavior");
        metrics::metrics().evidence_persisted.inc();
    }

    /// All stored evidence, for the slashing pipeline.
    pub fn load_evidence(&self) -> Vec<DuplicateVoteEvidence> {
        let cf = self.cf(CF_EVIDENCE);
        self.db
            .iterator_cf(cf, rocksdb::IteratorMode::Start)
            .filter_map(|item| item.ok())
            .filter_map(|(_, value)| bincode::deserialize(&value).ok())
            .collect()
    }
}

impl BlockStore for NodeStorage {
    fn height(&self) -> u64 {
        let start = Instant::now();
        let cf = self.cf(CF_BLOCKS);
        let height = self
            .db
            .get_cf(cf, CHAIN_HEIGHT_KEY)
            .ok()
            .flatten()
            .and_then(|v| <[u8; 8]>::try_from(v.as_slice()).ok())
            .map(u64::from_be_bytes)
            .unwrap_or(0);
        metrics::record_rocksdb_read(start.elapsed().as_secs_f64());
        height
    }

    /// # Panics
    ///
    /// Panics if the write fails. Committed blocks are essential for crash
    /// recovery; a gap in the chain would force a full resync.
    fn save_block(&self, block: &Block, _parts: &PartSet, seen_commit: &Commit) {
        let start = Instant::now();
        let cf = self.cf(CF_BLOCKS);
        let height = block.height();

        let mut batch = WriteBatch::default();
        batch.put_cf(
            cf,
            Self::block_key(height),
            bincode::serialize(block)
                .expect("block encoding must succeed - this is a bug if it fails"),
        );
        batch.put_cf(
            cf,
            Self::commit_key(height),
            bincode::serialize(seen_commit)
                .expect("commit encoding must succeed - this is a bug if it fails"),
        );
        if height > self.height() {
            batch.put_cf(cf, CHAIN_HEIGHT_KEY, height.to_be_bytes());
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db
            .write_opt(batch, &write_opts)
            .expect("SAFETY CRITICAL: block persistence failed - cannot maintain chain state");
        metrics::record_rocksdb_write(start.elapsed().as_secs_f64());
    }

    fn load_block(&self, height: u64) -> Option<Block> {
        let start = Instant::now();
        let cf = self.cf(CF_BLOCKS);
        let result = match self.db.get_cf(cf, Self::block_key(height)) {
            Ok(Some(value)) => match bincode::deserialize(&value) {
                Ok(block) => Some(block),
                Err(e) => {
                    error!(height, error = %e, "Failed to decode stored block");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                error!(height, error = %e, "Failed to read stored block");
                None
            }
        };
        metrics::record_rocksdb_read(start.elapsed().as_secs_f64());
        result
    }

    fn load_seen_commit(&self, height: u64) -> Option<Commit> {
        let cf = self.cf(CF_BLOCKS);
        match self.db.get_cf(cf, Self::commit_key(height)) {
            Ok(Some(value)) => bincode::deserialize(&value).ok(),
            _ => None,
        }
    }
}

impl KvStore for NodeStorage {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let start = Instant::now();
        let result = self.db.get_cf(self.cf(CF_STATE), key).ok().flatten();
        metrics::record_rocksdb_read(start.elapsed().as_secs_f64());
        result
    }

    fn put(&self, key: &[u8], value: &[u8]) {
        let start = Instant::now();
        self.db
            .put_cf(self.cf(CF_STATE), key, value)
            .expect("state write failed - cannot continue safely");
        metrics::record_rocksdb_write(start.elapsed().as_secs_f64());
    }

    fn put_sync(&self, key: &[u8], value: &[u8]) {
        let start = Instant::now();
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db
            .put_cf_opt(self.cf(CF_STATE), key, value, &write_opts)
            .expect("SAFETY CRITICAL: durable state write failed - cannot continue");
        metrics::record_rocksdb_write(start.elapsed().as_secs_f64());
    }
}
