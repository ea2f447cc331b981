//! Append-only action log with its action-state hash chain

use crate::model::{genesis_action_state, next_action_state, Action, ActionKind, Hash};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// A logged action with the chain value and tree root right after it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub action: Action,
    pub action_state: Hash,
    pub root_after: Hash,
}

/// A point in the log: the state after `sequence` (`None` = before any
/// action)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub sequence: Option<u64>,
    pub root: Hash,
    pub action_state: Hash,
}

impl Checkpoint {
    /// First sequence number after this checkpoint
    pub fn next_sequence(&self) -> u64 {
        self.sequence.map_or(0, |s| s + 1)
    }
}

/// Strictly ordered, gapless record of state changes for one collection
///
/// Sequence numbers equal positions in the log. The log is not
/// internally synchronized; the owning collection serializes writers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionLog {
    /// Tree root before the first action
    genesis_root: Hash,
    entries: Vec<LogEntry>,
}

impl ActionLog {
    /// Create an empty log for a tree whose empty root is `genesis_root`
    pub fn new(genesis_root: Hash) -> Self {
        ActionLog {
            genesis_root,
            entries: Vec::new(),
        }
    }

    /// Reassemble a log from stored entries; call [`verify`](Self::verify)
    /// before trusting it
    pub fn from_entries(genesis_root: Hash, entries: Vec<LogEntry>) -> Self {
        ActionLog {
            genesis_root,
            entries,
        }
    }

    /// Sequence number the next append will receive
    pub fn next_sequence(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an action at the next sequence slot
    pub fn append(
        &mut self,
        kind: ActionKind,
        index: u64,
        payload_hash: Hash,
        root_after: Hash,
    ) -> Action {
        let action = Action::new(kind, index, payload_hash, self.next_sequence());
        let action_state = next_action_state(&self.head_action_state(), &action);
        self.entries.push(LogEntry {
            action: action.clone(),
            action_state,
            root_after,
        });
        action
    }

    /// Append only if the next slot is `expected`
    pub fn append_expecting(
        &mut self,
        expected: u64,
        kind: ActionKind,
        index: u64,
        payload_hash: Hash,
        root_after: Hash,
    ) -> Result<Action> {
        let actual = self.next_sequence();
        if expected != actual {
            return Err(Error::ConcurrentAppendConflict { expected, actual });
        }
        Ok(self.append(kind, index, payload_hash, root_after))
    }

    pub fn entry(&self, sequence: u64) -> Result<&LogEntry> {
        self.entries
            .get(sequence as usize)
            .ok_or(Error::UnknownSequence(sequence))
    }

    /// Chain value after applying action `sequence`
    pub fn action_state_at(&self, sequence: u64) -> Result<Hash> {
        Ok(self.entry(sequence)?.action_state)
    }

    /// Chain value after the last action
    pub fn head_action_state(&self) -> Hash {
        self.entries
            .last()
            .map(|e| e.action_state)
            .unwrap_or_else(genesis_action_state)
    }

    /// Tree root after `sequence` (`None` = genesis)
    pub fn root_at(&self, sequence: Option<u64>) -> Result<Hash> {
        match sequence {
            None => Ok(self.genesis_root),
            Some(seq) => Ok(self.entry(seq)?.root_after),
        }
    }

    /// Checkpoint after `sequence` (`None` = genesis)
    pub fn checkpoint_at(&self, sequence: Option<u64>) -> Result<Checkpoint> {
        let (root, action_state) = match sequence {
            None => (self.genesis_root, genesis_action_state()),
            Some(seq) => {
                let entry = self.entry(seq)?;
                (entry.root_after, entry.action_state)
            }
        };
        Ok(Checkpoint {
            sequence,
            root,
            action_state,
        })
    }

    /// Find where a `(root, action_state)` pair occurs in local history
    pub fn position_of(&self, root: &Hash, action_state: &Hash) -> Option<Checkpoint> {
        if *action_state == genesis_action_state() {
            return (*root == self.genesis_root).then(|| Checkpoint {
                sequence: None,
                root: *root,
                action_state: *action_state,
            });
        }
        // Action states are unique per position, so at most one match
        self.entries
            .iter()
            .find(|e| e.action_state == *action_state)
            .filter(|e| e.root_after == *root)
            .map(|e| Checkpoint {
                sequence: Some(e.action.sequence),
                root: e.root_after,
                action_state: e.action_state,
            })
    }

    /// Actions strictly after `checkpoint`, in sequence order
    ///
    /// Re-querying from the same checkpoint yields the same actions unless
    /// more were appended in between.
    pub fn unconfirmed_since(&self, checkpoint: Option<u64>) -> impl Iterator<Item = &Action> + '_ {
        let start = checkpoint.map_or(0, |s| s as usize + 1);
        self.entries
            .get(start..)
            .unwrap_or(&[])
            .iter()
            .map(|e| &e.action)
    }

    /// Replay the chain and sequence numbers, detecting tampering
    pub fn verify(&self) -> Result<()> {
        let mut state = genesis_action_state();
        for (position, entry) in self.entries.iter().enumerate() {
            if entry.action.sequence != position as u64 {
                return Err(Error::Corruption(format!(
                    "action at position {} has sequence {}",
                    position, entry.action.sequence
                )));
            }
            state = next_action_state(&state, &entry.action);
            if state != entry.action_state {
                return Err(Error::Corruption(format!(
                    "action state mismatch at sequence {}",
                    position
                )));
            }
        }
        Ok(())
    }
}

/// Recompute the action state of an ordered action list from scratch
pub fn replay_action_state(actions: &[Action]) -> Hash {
    actions
        .iter()
        .fold(genesis_action_state(), |state, action| {
            next_action_state(&state, action)
        })
}
