//! Sparse Merkle tree over document slots
//!
//! Every collection owns one fixed-height tree:
//! - Leaves hold `H(payload_hash)`; empty leaves hold `Hash::ZERO`
//! - Internal nodes hold `H(left, right)`, with per-level empty hashes
//! - Only non-empty nodes are stored, keyed by `(level, index)`

mod node;
mod tree;

pub use node::{
    empty_hashes, leaf_hash, root_from_witness, verify_witness, MerkleNode, MerkleWitness,
    WitnessStep,
};
pub use tree::{MerkleStore, TreeSnapshot, ABSOLUTE_MAX_HEIGHT};
