//! SHA-256 hash wrapper used throughout consensus.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// A 32-byte SHA-256 hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; 32]);

/// Error parsing a hash from a hex string.
#[derive(Debug, thiserror::Error)]
pub enum HexError {
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("expected 32 bytes, got {0}")]
    BadLength(usize),
}

impl Hash {
    /// The all-zero hash.
    pub const ZERO: Hash = Hash([0u8; 32]);

    /// Hash arbitrary bytes with SHA-256.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Hash(hasher.finalize().into())
    }

    /// Wrap raw hash bytes without hashing.
    ///
    /// Panics if `bytes` is not exactly 32 bytes; use only with known digests.
    pub fn from_hash_bytes(bytes: &[u8]) -> Self {
        let mut out = [0u8; 32];
        out.copy_from_slice(bytes);
        Hash(out)
    }

    /// Raw bytes of the hash.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// True if this is the all-zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form for logs; full form available via Display.
        write!(f, "{}", &hex::encode(self.0)[..12])
    }
}

impl FromStr for Hash {
    type Err = HexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(HexError::BadLength(bytes.len()));
        }
        Ok(Hash::from_hash_bytes(&bytes))
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Root of a simple binary merkle tree over the given leaf hashes.
///
/// Odd nodes are promoted unpaired. An empty leaf set hashes to [`Hash::ZERO`].
pub fn merkle_root(leaves: &[Hash]) -> Hash {
    if leaves.is_empty() {
        return Hash::ZERO;
    }
    let mut level: Vec<Hash> = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            if pair.len() == 2 {
                next.push(hash_pair(&pair[0], &pair[1]));
            } else {
                next.push(pair[0]);
            }
        }
        level = next;
    }
    level[0]
}

fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left.as_bytes());
    buf[32..].copy_from_slice(right.as_bytes());
    Hash::from_bytes(&buf)
}

/// Merkle inclusion proof for a leaf at `index` in a tree of `total` leaves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub index: u32,
    pub total: u32,
    /// Sibling hashes from leaf level to root.
    pub siblings: Vec<Hash>,
}

impl MerkleProof {
    /// Build proofs for every leaf. Returns one proof per leaf, in order.
    pub fn build_all(leaves: &[Hash]) -> Vec<MerkleProof> {
        let total = leaves.len() as u32;
        let mut proofs: Vec<MerkleProof> = (0..total)
            .map(|index| MerkleProof {
                index,
                total,
                siblings: Vec::new(),
            })
            .collect();

        // Track which leaves live under each node of the current level.
        let mut level: Vec<Hash> = leaves.to_vec();
        let mut owners: Vec<Vec<u32>> = (0..total).map(|i| vec![i]).collect();

        while level.len() > 1 {
            let mut next_level = Vec::with_capacity(level.len().div_ceil(2));
            let mut next_owners = Vec::with_capacity(level.len().div_ceil(2));
            let mut i = 0;
            while i < level.len() {
                if i + 1 < level.len() {
                    // Left node's leaves get the right sibling, and vice versa.
                    for &leaf in &owners[i] {
                        proofs[leaf as usize].siblings.push(level[i + 1]);
                    }
                    for &leaf in &owners[i + 1] {
                        proofs[leaf as usize].siblings.push(level[i]);
                    }
                    next_level.push(hash_pair(&level[i], &level[i + 1]));
                    let mut merged = owners[i].clone();
                    merged.extend_from_slice(&owners[i + 1]);
                    next_owners.push(merged);
                    i += 2;
                } else {
                    next_level.push(level[i]);
                    next_owners.push(owners[i].clone());
                    i += 1;
                }
            }
            level = next_level;
            owners = next_owners;
        }

        proofs
    }

    /// Verify that `leaf` at this proof's index hashes up to `root`.
    pub fn verify(&self, root: &Hash, leaf: &Hash) -> bool {
        if self.index >= self.total {
            return false;
        }
        let mut acc = *leaf;
        let mut index = self.index;
        let mut width = self.total;
        let mut sib = self.siblings.iter();
        while width > 1 {
            let has_pair = index ^ 1 < width;
            if has_pair {
                let Some(s) = sib.next() else { return false };
                acc = if index % 2 == 0 {
                    hash_pair(&acc, s)
                } else {
                    hash_pair(s, &acc)
                };
            }
            index /= 2;
            width = width.div_ceil(2);
        }
        sib.next().is_none() && acc == *root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_roundtrips_through_hex() {
        let h = Hash::from_bytes(b"hello");
        let s = h.to_string();
        let parsed: Hash = s.parse().unwrap();
        assert_eq!(h, parsed);
    }

    #[test]
    fn zero_hash_is_zero() {
        assert!(Hash::ZERO.is_zero());
        assert!(!Hash::from_bytes(b"x").is_zero());
    }

    #[test]
    fn merkle_root_of_empty_is_zero() {
        assert_eq!(merkle_root(&[]), Hash::ZERO);
    }

    #[test]
    fn merkle_root_of_single_leaf_is_leaf() {
        let leaf = Hash::from_bytes(b"leaf");
        assert_eq!(merkle_root(&[leaf]), leaf);
    }

    #[test]
    fn merkle_proofs_verify_for_all_sizes() {
        for n in 1..=9u8 {
            let leaves: Vec<Hash> = (0..n).map(|i| Hash::from_bytes(&[i])).collect();
            let root = merkle_root(&leaves);
            let proofs = MerkleProof::build_all(&leaves);
            assert_eq!(proofs.len(), n as usize);
            for (i, proof) in proofs.iter().enumerate() {
                assert!(proof.verify(&root, &leaves[i]), "n={} i={}", n, i);
                // Wrong leaf must not verify.
                let wrong = Hash::from_bytes(b"wrong");
                if wrong != leaves[i] {
                    assert!(!proof.verify(&root, &wrong));
                }
            }
        }
    }
}
