//! RollupRecord type - one attempted on-chain state transition

use super::{now_millis, Hash};
use crate::prover::Proof;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a rollup record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RollupStatus {
    /// Created, not yet handed to the chain
    Pending,
    /// Handed to the chain, awaiting confirmation
    Submitted,
    Confirmed,
    Rejected,
}

impl RollupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RollupStatus::Pending => "pending",
            RollupStatus::Submitted => "submitted",
            RollupStatus::Confirmed => "confirmed",
            RollupStatus::Rejected => "rejected",
        }
    }

    /// Pending and Submitted records hold the collection's single rollup slot
    pub fn is_in_flight(&self) -> bool {
        matches!(self, RollupStatus::Pending | RollupStatus::Submitted)
    }
}

impl fmt::Display for RollupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An attempted state transition `previous -> new` covering the actions
/// `first_sequence..=last_sequence`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RollupRecord {
    /// Per-collection record counter
    pub id: u64,
    pub collection: String,
    pub previous_root: Hash,
    pub new_root: Hash,
    pub previous_action_state: Hash,
    pub new_action_state: Hash,
    pub first_sequence: u64,
    pub last_sequence: u64,
    pub proof: Proof,
    pub status: RollupStatus,
    /// Chain-provided reason when rejected
    pub rejection: Option<String>,
    /// Creation time (unix millis)
    pub created_at: u64,
    /// When the record was handed to the chain (unix millis)
    pub submitted_at: Option<u64>,
}

impl RollupRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        collection: impl Into<String>,
        previous_root: Hash,
        new_root: Hash,
        previous_action_state: Hash,
        new_action_state: Hash,
        first_sequence: u64,
        last_sequence: u64,
        proof: Proof,
    ) -> Self {
        RollupRecord {
            id,
            collection: collection.into(),
            previous_root,
            new_root,
            previous_action_state,
            new_action_state,
            first_sequence,
            last_sequence,
            proof,
            status: RollupStatus::Pending,
            rejection: None,
            created_at: now_millis(),
            submitted_at: None,
        }
    }

    /// Number of actions covered
    pub fn action_count(&self) -> u64 {
        self.last_sequence - self.first_sequence + 1
    }
}
