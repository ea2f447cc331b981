//! Sparse fixed-height Merkle tree over document slots

use super::node::{empty_hashes, leaf_hash, MerkleNode, MerkleWitness, WitnessStep};
use crate::model::Hash;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Hard upper bound on tree height so that `2^height` fits in a `u64` index
pub const ABSOLUTE_MAX_HEIGHT: u8 = 63;

/// A sparse Merkle tree
///
/// Only nodes whose hash differs from the empty hash of their level are
/// stored, keyed by `(level, index)`. Everything else is implied empty.
#[derive(Clone, Debug)]
pub struct MerkleStore {
    height: u8,
    /// Non-empty leaf values (payload hashes), by index
    leaves: BTreeMap<u64, Hash>,
    /// Non-empty node hashes, level 0 = hashed leaves
    nodes: HashMap<(u8, u64), Hash>,
    /// Empty-subtree hash per level
    empty: Vec<Hash>,
    /// Cached root
    root: Hash,
}

/// Persisted form of a [`MerkleStore`]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TreeSnapshot {
    pub height: u8,
    pub leaves: Vec<(u64, Hash)>,
    pub nodes: Vec<(u8, u64, Hash)>,
    pub root: Hash,
}

impl MerkleStore {
    /// Create an empty tree
    pub fn create(height: u8, max_height: u8) -> Result<Self> {
        let max = max_height.min(ABSOLUTE_MAX_HEIGHT);
        if height < 1 || height > max {
            return Err(Error::InvalidHeight { height, max });
        }
        let empty = empty_hashes(height);
        let root = empty[height as usize];
        Ok(MerkleStore {
            height,
            leaves: BTreeMap::new(),
            nodes: HashMap::new(),
            empty,
            root,
        })
    }

    pub fn height(&self) -> u8 {
        self.height
    }

    /// Number of leaf slots, `2^height`
    pub fn capacity(&self) -> u64 {
        1u64 << self.height
    }

    /// Current root
    pub fn root(&self) -> Hash {
        self.root
    }

    /// Root of the tree with every leaf empty
    pub fn empty_root(&self) -> Hash {
        self.empty[self.height as usize]
    }

    /// Number of occupied leaves
    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Value stored at a leaf (`Hash::ZERO` when empty)
    pub fn leaf(&self, index: u64) -> Result<Hash> {
        self.check_index(index)?;
        Ok(self.leaves.get(&index).copied().unwrap_or(Hash::ZERO))
    }

    /// Set a leaf value and return the new root. `Hash::ZERO` clears it.
    pub fn set_leaf(&mut self, index: u64, value: Hash) -> Result<Hash> {
        self.check_index(index)?;

        if value.is_zero() {
            self.leaves.remove(&index);
        } else {
            self.leaves.insert(index, value);
        }

        let mut current = leaf_hash(&value);
        let mut idx = index;
        self.store_node(0, idx, current);

        for level in 0..self.height {
            let sibling = self.node_hash(level, idx ^ 1);
            current = if idx & 1 == 0 {
                Hash::combine(&current, &sibling)
            } else {
                Hash::combine(&sibling, &current)
            };
            idx >>= 1;
            self.store_node(level + 1, idx, current);
        }

        self.root = current;
        Ok(current)
    }

    /// Sibling path for a leaf. Does not mutate.
    pub fn witness(&self, index: u64) -> Result<MerkleWitness> {
        self.check_index(index)?;

        let mut path = Vec::with_capacity(self.height as usize);
        let mut idx = index;
        for level in 0..self.height {
            path.push(WitnessStep {
                sibling: self.node_hash(level, idx ^ 1),
                is_left: idx & 1 == 0,
            });
            idx >>= 1;
        }
        Ok(MerkleWitness::new(path))
    }

    /// Inspect a single node
    pub fn node(&self, level: u8, index: u64) -> Result<MerkleNode> {
        if level > self.height {
            return Err(Error::InvalidHeight {
                height: level,
                max: self.height,
            });
        }
        let width = 1u64 << (self.height - level);
        if index >= width {
            return Err(Error::IndexOutOfRange {
                index,
                height: self.height - level,
            });
        }
        let stored = self.nodes.get(&(level, index)).copied();
        Ok(MerkleNode {
            level,
            index,
            hash: stored.unwrap_or(self.empty[level as usize]),
            empty: stored.is_none(),
        })
    }

    /// Every node on the path from leaf `index` to the root, as
    /// `(level, index, hash)` with `None` where the node is empty
    pub fn path_nodes(&self, index: u64) -> Result<Vec<(u8, u64, Option<Hash>)>> {
        self.check_index(index)?;
        Ok((0..=self.height)
            .map(|level| {
                let idx = index >> level;
                (level, idx, self.nodes.get(&(level, idx)).copied())
            })
            .collect())
    }

    /// Occupied leaves in index order
    pub fn leaves(&self) -> impl Iterator<Item = (u64, Hash)> + '_ {
        self.leaves.iter().map(|(i, h)| (*i, *h))
    }

    /// Rebuild the root from the stored leaves alone, ignoring the cached
    /// internal nodes
    pub fn recompute_root(&self) -> Hash {
        let (root, _) = self.rebuild();
        root
    }

    /// Snapshot for persistence
    pub fn snapshot(&self) -> TreeSnapshot {
        let mut nodes: Vec<(u8, u64, Hash)> =
            self.nodes.iter().map(|((l, i), h)| (*l, *i, *h)).collect();
        nodes.sort_by_key(|(l, i, _)| (*l, *i));
        TreeSnapshot {
            height: self.height,
            leaves: self.leaves().collect(),
            nodes,
            root: self.root,
        }
    }

    /// Restore from a snapshot, rejecting anything whose stored nodes or
    /// root disagree with a recomputation from its leaves
    pub fn restore(snapshot: TreeSnapshot, max_height: u8) -> Result<Self> {
        let mut tree = Self::create(snapshot.height, max_height)?;
        for (index, value) in snapshot.leaves {
            tree.check_index(index)
                .map_err(|_| Error::Corruption(format!("leaf index {} out of range", index)))?;
            if !value.is_zero() {
                tree.leaves.insert(index, value);
            }
        }

        let (root, nodes) = tree.rebuild();
        if root != snapshot.root {
            return Err(Error::Corruption(format!(
                "stored root {} does not match recomputed root {}",
                snapshot.root.short(),
                root.short()
            )));
        }
        for (level, index, hash) in snapshot.nodes {
            if nodes.get(&(level, index)) != Some(&hash) {
                return Err(Error::Corruption(format!(
                    "node ({}, {}) disagrees with its leaves",
                    level, index
                )));
            }
        }

        tree.nodes = nodes;
        tree.root = root;
        Ok(tree)
    }

    // === Internal helpers ===

    fn check_index(&self, index: u64) -> Result<()> {
        if index >= self.capacity() {
            return Err(Error::IndexOutOfRange {
                index,
                height: self.height,
            });
        }
        Ok(())
    }

    fn node_hash(&self, level: u8, index: u64) -> Hash {
        self.nodes
            .get(&(level, index))
            .copied()
            .unwrap_or(self.empty[level as usize])
    }

    fn store_node(&mut self, level: u8, index: u64, hash: Hash) {
        if hash == self.empty[level as usize] {
            self.nodes.remove(&(level, index));
        } else {
            self.nodes.insert((level, index), hash);
        }
    }

    /// Bottom-up rebuild touching only non-empty subtrees
    fn rebuild(&self) -> (Hash, HashMap<(u8, u64), Hash>) {
        let mut all = HashMap::new();
        let mut current: BTreeMap<u64, Hash> = self
            .leaves
            .iter()
            .map(|(i, v)| (*i, leaf_hash(v)))
            .collect();

        for level in 0..self.height {
            for (index, hash) in &current {
                all.insert((level, *index), *hash);
            }
            let empty = self.empty[level as usize];
            let mut parents = BTreeMap::new();
            for index in current.keys() {
                let parent = index >> 1;
                if parents.contains_key(&parent) {
                    continue;
                }
                let left = current.get(&(parent << 1)).copied().unwrap_or(empty);
                let right = current.get(&((parent << 1) | 1)).copied().unwrap_or(empty);
                parents.insert(parent, Hash::combine(&left, &right));
            }
            current = parents;
        }

        let root = current
            .get(&0)
            .copied()
            .unwrap_or(self.empty[self.height as usize]);
        if current.contains_key(&0) {
            all.insert((self.height, 0), root);
        }
        (root, all)
    }
}
