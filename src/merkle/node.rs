//! Tree node and witness types

use crate::model::Hash;
use serde::{Deserialize, Serialize};

/// A node of the sparse tree as seen by callers
///
/// Level 0 holds leaves; level `height` holds the root at index 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleNode {
    pub level: u8,
    pub index: u64,
    pub hash: Hash,
    /// True when the whole subtree below this node is empty
    pub empty: bool,
}

/// One step of a witness path
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WitnessStep {
    /// Hash of the sibling at this level
    pub sibling: Hash,
    /// True when the path node is the left child, i.e. the sibling sits on
    /// the right
    pub is_left: bool,
}

/// Sibling path from a leaf to the root; its length equals the tree height
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleWitness {
    pub path: Vec<WitnessStep>,
}

impl MerkleWitness {
    pub fn new(path: Vec<WitnessStep>) -> Self {
        MerkleWitness { path }
    }

    pub fn height(&self) -> usize {
        self.path.len()
    }

    /// Leaf index encoded by the left/right bits of the path
    pub fn index(&self) -> u64 {
        self.path
            .iter()
            .enumerate()
            .fold(0u64, |acc, (level, step)| {
                if step.is_left {
                    acc
                } else {
                    acc | (1u64 << level)
                }
            })
    }

    /// Recompute the root for a leaf holding `value` (`Hash::ZERO` for an
    /// empty leaf)
    pub fn root_for(&self, value: &Hash) -> Hash {
        root_from_witness(value, self)
    }
}

/// Hash stored at level 0 for a leaf value: `H(value)`, or the empty hash
pub fn leaf_hash(value: &Hash) -> Hash {
    if value.is_zero() {
        Hash::ZERO
    } else {
        Hash::digest(value.as_bytes())
    }
}

/// Empty-subtree hashes for levels `0..=height`
pub fn empty_hashes(height: u8) -> Vec<Hash> {
    let mut hashes = Vec::with_capacity(height as usize + 1);
    let mut current = Hash::ZERO;
    hashes.push(current);
    for _ in 0..height {
        current = Hash::combine(&current, &current);
        hashes.push(current);
    }
    hashes
}

/// Standard path-hash recomputation
pub fn root_from_witness(value: &Hash, witness: &MerkleWitness) -> Hash {
    witness
        .path
        .iter()
        .fold(leaf_hash(value), |current, step| {
            if step.is_left {
                Hash::combine(&current, &step.sibling)
            } else {
                Hash::combine(&step.sibling, &current)
            }
        })
}

/// Check that `value` sits at the witness's index under `root`
pub fn verify_witness(root: &Hash, value: &Hash, witness: &MerkleWitness) -> bool {
    root_from_witness(value, witness) == *root
}
