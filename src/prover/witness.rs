//! Witness and proof types consumed and produced by a [`Prover`](super::Prover)

use crate::merkle::{root_from_witness, MerkleWitness};
use crate::model::{next_action_state, Action, ActionKind, Hash};
use serde::{Deserialize, Serialize};

const ACTION_TAG: u8 = 0;
const BATCH_TAG: u8 = 1;

/// An opaque proof plus the public-input commitment it attests to
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    pub bytes: Vec<u8>,
    /// Commitment to the witness's public inputs
    pub commitment: Hash,
    /// Identifier of the backend that produced it
    pub prover: String,
}

/// Everything needed to prove a single action: the pre-state path of its
/// leaf and both ends of the transition
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionWitness {
    pub collection: String,
    pub action: Action,
    /// Leaf value before the action (`Hash::ZERO` when empty)
    pub previous_leaf: Hash,
    /// Sibling path of the action's leaf; siblings are unchanged by the
    /// action, so the same path proves both roots
    pub path: MerkleWitness,
    pub previous_root: Hash,
    pub new_root: Hash,
    pub previous_action_state: Hash,
    pub new_action_state: Hash,
}

impl ActionWitness {
    /// Leaf value after the action
    pub fn new_leaf(&self) -> Hash {
        match self.action.kind {
            ActionKind::Delete => Hash::ZERO,
            ActionKind::Insert | ActionKind::Update => self.action.payload_hash,
        }
    }

    /// Check internal consistency, returning a reason on failure
    pub fn check(&self) -> std::result::Result<(), String> {
        if self.path.index() != self.action.index {
            return Err(format!(
                "path index {} does not match action index {}",
                self.path.index(),
                self.action.index
            ));
        }
        match self.action.kind {
            ActionKind::Insert if !self.previous_leaf.is_zero() => {
                return Err("insert over an occupied leaf".into())
            }
            ActionKind::Update | ActionKind::Delete if self.previous_leaf.is_zero() => {
                return Err(format!("{} of an empty leaf", self.action.kind))
            }
            _ => {}
        }
        if root_from_witness(&self.previous_leaf, &self.path) != self.previous_root {
            return Err("path does not open the previous root".into());
        }
        if root_from_witness(&self.new_leaf(), &self.path) != self.new_root {
            return Err("path does not open the new root".into());
        }
        if next_action_state(&self.previous_action_state, &self.action) != self.new_action_state {
            return Err("action state does not follow from the action".into());
        }
        Ok(())
    }
}

/// A run of consecutive proved actions folded into one transition
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchWitness {
    pub collection: String,
    pub previous_root: Hash,
    pub new_root: Hash,
    pub previous_action_state: Hash,
    pub new_action_state: Hash,
    /// Per-action witnesses in sequence order
    pub actions: Vec<ActionWitness>,
    /// Per-action proofs, parallel to `actions`
    pub proofs: Vec<Proof>,
}

impl BatchWitness {
    pub fn first_sequence(&self) -> Option<u64> {
        self.actions.first().map(|w| w.action.sequence)
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.actions.last().map(|w| w.action.sequence)
    }

    /// Check continuity of the run and that every proof binds its witness
    pub fn check(&self) -> std::result::Result<(), String> {
        if self.actions.is_empty() {
            return Err("empty batch".into());
        }
        if self.actions.len() != self.proofs.len() {
            return Err(format!(
                "{} witnesses but {} proofs",
                self.actions.len(),
                self.proofs.len()
            ));
        }

        let mut root = self.previous_root;
        let mut state = self.previous_action_state;
        let mut expected_sequence = self.actions[0].action.sequence;
        for (witness, proof) in self.actions.iter().zip(&self.proofs) {
            if witness.action.sequence != expected_sequence {
                return Err(format!(
                    "gap in batch at sequence {}",
                    witness.action.sequence
                ));
            }
            if witness.previous_root != root || witness.previous_action_state != state {
                return Err(format!(
                    "action {} does not continue from the previous state",
                    witness.action.sequence
                ));
            }
            if proof.commitment != Witness::Action(witness.clone()).commitment() {
                return Err(format!(
                    "proof for action {} commits to a different witness",
                    witness.action.sequence
                ));
            }
            root = witness.new_root;
            state = witness.new_action_state;
            expected_sequence += 1;
        }

        if root != self.new_root || state != self.new_action_state {
            return Err("batch end state does not match its actions".into());
        }
        Ok(())
    }
}

/// Input to the proving backend
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Witness {
    Action(ActionWitness),
    Batch(BatchWitness),
}

impl Witness {
    /// Commitment to the public inputs: collection, both roots and both
    /// action states
    pub fn commitment(&self) -> Hash {
        match self {
            Witness::Action(w) => public_commitment(
                ACTION_TAG,
                &w.collection,
                &w.previous_root,
                &w.new_root,
                &w.previous_action_state,
                &w.new_action_state,
            ),
            Witness::Batch(w) => public_commitment(
                BATCH_TAG,
                &w.collection,
                &w.previous_root,
                &w.new_root,
                &w.previous_action_state,
                &w.new_action_state,
            ),
        }
    }

    /// Structural check of the witness
    pub fn check(&self) -> std::result::Result<(), String> {
        match self {
            Witness::Action(w) => w.check(),
            Witness::Batch(w) => w.check(),
        }
    }
}

/// Public-input commitment of an aggregate transition, as checked by the
/// settlement contract
pub fn batch_commitment(
    collection: &str,
    previous_root: &Hash,
    new_root: &Hash,
    previous_action_state: &Hash,
    new_action_state: &Hash,
) -> Hash {
    public_commitment(
        BATCH_TAG,
        collection,
        previous_root,
        new_root,
        previous_action_state,
        new_action_state,
    )
}

fn public_commitment(
    tag: u8,
    collection: &str,
    previous_root: &Hash,
    new_root: &Hash,
    previous_action_state: &Hash,
    new_action_state: &Hash,
) -> Hash {
    Hash::digest_many(&[
        &[tag],
        &(collection.len() as u64).to_le_bytes(),
        collection.as_bytes(),
        previous_root.as_bytes(),
        new_root.as_bytes(),
        previous_action_state.as_bytes(),
        new_action_state.as_bytes(),
    ])
}
