//! Action type - a single pending state mutation

use super::Hash;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Domain string hashed to produce the genesis action state
const GENESIS_DOMAIN: &[u8] = b"rollup_db/action-state/genesis";

/// The kind of mutation an action applies to its leaf
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    Insert,
    Update,
    Delete,
}

impl ActionKind {
    pub fn as_byte(&self) -> u8 {
        match self {
            ActionKind::Insert => 0,
            ActionKind::Update => 1,
            ActionKind::Delete => 2,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(ActionKind::Insert),
            1 => Some(ActionKind::Update),
            2 => Some(ActionKind::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Insert => "insert",
            ActionKind::Update => "update",
            ActionKind::Delete => "delete",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable, totally ordered state change awaiting proof and
/// on-chain confirmation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    /// Leaf index the action touches
    pub index: u64,
    /// Hash of the document payload (`Hash::ZERO` for deletes)
    pub payload_hash: Hash,
    pub kind: ActionKind,
    /// Gapless, strictly increasing per collection, starting at 0
    pub sequence: u64,
}

impl Action {
    pub fn new(kind: ActionKind, index: u64, payload_hash: Hash, sequence: u64) -> Self {
        Action {
            index,
            payload_hash,
            kind,
            sequence,
        }
    }

    /// `H(action)`, the value folded into the action-state chain
    pub fn hash(&self) -> Hash {
        Hash::digest_many(&[
            &self.sequence.to_le_bytes(),
            &[self.kind.as_byte()],
            &self.index.to_le_bytes(),
            self.payload_hash.as_bytes(),
        ])
    }
}

/// The action state before any action was applied
pub fn genesis_action_state() -> Hash {
    Hash::digest(GENESIS_DOMAIN)
}

/// Fold one action into an action state: `H(previous, H(action))`
pub fn next_action_state(previous: &Hash, action: &Action) -> Hash {
    Hash::combine(previous, &action.hash())
}
