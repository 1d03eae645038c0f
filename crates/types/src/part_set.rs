//! Block parts.
//!
//! A proposed block is gossiped as an ordered sequence of fixed-size parts,
//! merkle-rooted so each part can be verified independently. Replicas fill a
//! [`PartSet`] incrementally as parts arrive and reassemble the block bytes
//! once complete.

use crate::hash::{merkle_root, Hash, MerkleProof};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default size of a block part in bytes.
pub const DEFAULT_PART_SIZE: usize = 65536;

/// Identifies a part set: total part count and the merkle root of part hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartSetHeader {
    pub total: u32,
    pub hash: Hash,
}

impl PartSetHeader {
    pub fn zero() -> Self {
        PartSetHeader {
            total: 0,
            hash: Hash::ZERO,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.total == 0 && self.hash.is_zero()
    }
}

impl fmt::Display for PartSetHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:?}", self.total, self.hash)
    }
}

/// One part of a block, with its merkle inclusion proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    pub index: u32,
    pub bytes: Vec<u8>,
    pub proof: MerkleProof,
}

impl Part {
    pub fn hash(&self) -> Hash {
        Hash::from_bytes(&self.bytes)
    }
}

/// Errors from adding a part to a set.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PartSetError {
    #[error("part index {index} out of bounds (total {total})")]
    IndexOutOfBounds { index: u32, total: u32 },
    #[error("part proof does not match part set root")]
    InvalidProof,
}

/// A set of block parts being assembled (or already complete).
#[derive(Debug, Clone)]
pub struct PartSet {
    header: PartSetHeader,
    parts: Vec<Option<Part>>,
    count: u32,
}

impl PartSet {
    /// Split serialized block bytes into a complete part set.
    pub fn from_data(data: &[u8], part_size: usize) -> Self {
        assert!(part_size > 0, "part size must be positive");
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![&[]]
        } else {
            data.chunks(part_size).collect()
        };
        let leaf_hashes: Vec<Hash> = chunks.iter().map(|c| Hash::from_bytes(c)).collect();
        let root = merkle_root(&leaf_hashes);
        let proofs = MerkleProof::build_all(&leaf_hashes);
        let total = chunks.len() as u32;

        let parts = chunks
            .into_iter()
            .zip(proofs)
            .enumerate()
            .map(|(index, (bytes, proof))| {
                Some(Part {
                    index: index as u32,
                    bytes: bytes.to_vec(),
                    proof,
                })
            })
            .collect();

        PartSet {
            header: PartSetHeader { total, hash: root },
            parts,
            count: total,
        }
    }

    /// An empty set expecting parts matching `header`.
    pub fn from_header(header: PartSetHeader) -> Self {
        PartSet {
            parts: vec![None; header.total as usize],
            header,
            count: 0,
        }
    }

    pub fn header(&self) -> PartSetHeader {
        self.header
    }

    pub fn has_header(&self, header: &PartSetHeader) -> bool {
        self.header == *header
    }

    pub fn total(&self) -> u32 {
        self.header.total
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_complete(&self) -> bool {
        self.count == self.header.total
    }

    pub fn get_part(&self, index: u32) -> Option<&Part> {
        self.parts.get(index as usize).and_then(|p| p.as_ref())
    }

    /// Add a part, verifying its inclusion proof against the set's root.
    ///
    /// Returns `Ok(false)` for a duplicate of an already-held part.
    pub fn add_part(&mut self, part: Part) -> Result<bool, PartSetError> {
        if part.index >= self.header.total {
            return Err(PartSetError::IndexOutOfBounds {
                index: part.index,
                total: self.header.total,
            });
        }
        if self.parts[part.index as usize].is_some() {
            return Ok(false);
        }
        if part.proof.index != part.index
            || part.proof.total != self.header.total
            || !part.proof.verify(&self.header.hash, &part.hash())
        {
            return Err(PartSetError::InvalidProof);
        }
        let index = part.index as usize;
        self.parts[index] = Some(part);
        self.count += 1;
        Ok(true)
    }

    /// Concatenate all part bytes. Only valid once complete.
    pub fn assemble(&self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }
        let mut out = Vec::new();
        for part in self.parts.iter().flatten() {
            out.extend_from_slice(&part.bytes);
        }
        Some(out)
    }

    /// Bit array of which parts we hold, for gossip coordination.
    pub fn bit_array(&self) -> BitArray {
        BitArray {
            bits: self.parts.iter().map(|p| p.is_some()).collect(),
        }
    }
}

/// A simple bit array, displayed as `x` / `_` per bit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitArray {
    pub bits: Vec<bool>,
}

impl BitArray {
    pub fn new(size: usize) -> Self {
        BitArray {
            bits: vec![false; size],
        }
    }

    pub fn set(&mut self, index: usize, value: bool) {
        if let Some(bit) = self.bits.get_mut(index) {
            *bit = value;
        }
    }

    pub fn get(&self, index: usize) -> bool {
        self.bits.get(index).copied().unwrap_or(false)
    }
}

impl fmt::Display for BitArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &bit in &self.bits {
            write!(f, "{}", if bit { 'x' } else { '_' })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_and_reassemble() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let set = PartSet::from_data(&data, DEFAULT_PART_SIZE);
        assert!(set.is_complete());
        assert_eq!(set.total(), 4);
        assert_eq!(set.assemble().unwrap(), data);
    }

    #[test]
    fn incremental_fill_with_proof_verification() {
        let data = vec![42u8; 3 * DEFAULT_PART_SIZE + 17];
        let full = PartSet::from_data(&data, DEFAULT_PART_SIZE);
        let mut partial = PartSet::from_header(full.header());

        // Deliver out of order.
        for index in [2u32, 0, 3, 1] {
            let part = full.get_part(index).unwrap().clone();
            assert_eq!(partial.add_part(part), Ok(true));
        }
        assert!(partial.is_complete());
        assert_eq!(partial.assemble().unwrap(), data);
    }

    #[test]
    fn duplicate_part_is_not_an_error() {
        let data = vec![1u8; DEFAULT_PART_SIZE * 2];
        let full = PartSet::from_data(&data, DEFAULT_PART_SIZE);
        let mut partial = PartSet::from_header(full.header());
        let part = full.get_part(0).unwrap().clone();
        assert_eq!(partial.add_part(part.clone()), Ok(true));
        assert_eq!(partial.add_part(part), Ok(false));
        assert_eq!(partial.count(), 1);
    }

    #[test]
    fn tampered_part_rejected() {
        let data = vec![7u8; DEFAULT_PART_SIZE + 1];
        let full = PartSet::from_data(&data, DEFAULT_PART_SIZE);
        let mut partial = PartSet::from_header(full.header());
        let mut part = full.get_part(1).unwrap().clone();
        part.bytes[0] ^= 0xff;
        assert_eq!(partial.add_part(part), Err(PartSetError::InvalidProof));
    }

    #[test]
    fn out_of_bounds_part_rejected() {
        let full = PartSet::from_data(&[1, 2, 3], DEFAULT_PART_SIZE);
        let mut partial = PartSet::from_header(full.header());
        let mut part = full.get_part(0).unwrap().clone();
        part.index = 9;
        assert!(matches!(
            partial.add_part(part),
            Err(PartSetError::IndexOutOfBounds { .. })
        ));
    }

    #[test]
    fn empty_data_still_makes_one_part() {
        let set = PartSet::from_data(&[], DEFAULT_PART_SIZE);
        assert_eq!(set.total(), 1);
        assert!(set.is_complete());
        assert_eq!(set.assemble().unwrap(), Vec::<u8>::new());
    }
}
