//! Storage abstractions.
//!
//! Consensus writes through these traits; the node backs them with RocksDB,
//! the simulation with in-memory maps. Readers (RPC, peers catching up) only
//! ever see committed data because writes happen during commit finalization
//! on the single event-loop thread.

use parking_lot::RwLock;
use stanchion_types::{Block, Commit, PartSet};
use std::collections::BTreeMap;

/// A minimal key-value store.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
    fn put(&self, key: &[u8], value: &[u8]);

    /// Durable write: must not return before the value is fsynced (or the
    /// backend's equivalent).
    fn put_sync(&self, key: &[u8], value: &[u8]);
}

/// Committed blocks plus the precommit set that committed each one.
pub trait BlockStore: Send + Sync {
    /// Height of the highest stored block; 0 when empty.
    fn height(&self) -> u64;

    /// Persist a committed block, its part set, and the seen commit.
    ///
    /// The seen commit is the 2/3 precommit set this node observed; it may
    /// differ from the commit a later block carries.
    fn save_block(&self, block: &Block, parts: &PartSet, seen_commit: &Commit);

    fn load_block(&self, height: u64) -> Option<Block>;
    fn load_seen_commit(&self, height: u64) -> Option<Commit>;
}

/// In-memory [`KvStore`].
#[derive(Default)]
pub struct MemKvStore {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemKvStore {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.map.read().get(key).cloned()
    }

    fn put(&self, key: &[u8], value: &[u8]) {
        self.map.write().insert(key.to_vec(), value.to_vec());
    }

    fn put_sync(&self, key: &[u8], value: &[u8]) {
        self.put(key, value);
    }
}

/// In-memory [`BlockStore`].
#[derive(Default)]
pub struct MemBlockStore {
    inner: RwLock<MemBlockStoreInner>,
}

#[derive(Default)]
struct MemBlockStoreInner {
    height: u64,
    blocks: BTreeMap<u64, Block>,
    seen_commits: BTreeMap<u64, Commit>,
}

impl MemBlockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockStore for MemBlockStore {
    fn height(&self) -> u64 {
        self.inner.read().height
    }

    fn save_block(&self, block: &Block, _parts: &PartSet, seen_commit: &Commit) {
        let mut inner = self.inner.write();
        let height = block.height();
        inner.blocks.insert(height, block.clone());
        inner.seen_commits.insert(height, seen_commit.clone());
        if height > inner.height {
            inner.height = height;
        }
    }

    fn load_block(&self, height: u64) -> Option<Block> {
        self.inner.read().blocks.get(&height).cloned()
    }

    fn load_seen_commit(&self, height: u64) -> Option<Commit> {
        self.inner.read().seen_commits.get(&height).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_kv_store_roundtrip() {
        let store = MemKvStore::new();
        assert!(store.get(b"k").is_none());
        store.put(b"k", b"v");
        assert_eq!(store.get(b"k"), Some(b"v".to_vec()));
        store.put_sync(b"k", b"v2");
        assert_eq!(store.get(b"k"), Some(b"v2".to_vec()));
    }
}
