//! Chain-submission collaborator
//!
//! The blockchain is external. The rollup processor talks to it through
//! [`ChainClient`]: hand over a record, poll for its fate, and read the
//! contract's current root/action state when repairing divergence.

mod local;

pub use local::{LocalChain, LocalChainState};

use crate::model::{Hash, RollupRecord};
use crate::Result;
use serde::{Deserialize, Serialize};

/// Opaque reference to a submitted rollup
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubmissionHandle {
    pub collection: String,
    pub id: u64,
}

/// What the contract currently holds for a collection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnChainState {
    pub root: Hash,
    pub action_state: Hash,
}

/// Outcome of a submission as seen by the chain
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confirmation {
    Confirmed { root: Hash, action_state: Hash },
    Rejected(String),
    Pending,
}

/// Contract to the chain-submission service
pub trait ChainClient: Send + Sync {
    /// Make sure a contract exists for `collection`, starting from the
    /// empty tree's root. Must be a no-op when one already exists.
    fn deploy(&self, collection: &str, genesis_root: Hash) -> Result<()>;

    /// Hand a record to the chain. Fire-and-forget: the outcome arrives
    /// through [`query_confirmation`](Self::query_confirmation).
    fn submit(&self, record: &RollupRecord) -> Result<SubmissionHandle>;

    /// Current fate of a submission
    fn query_confirmation(&self, handle: &SubmissionHandle) -> Result<Confirmation>;

    /// The contract's current root and last processed action state
    fn current_state(&self, collection: &str) -> Result<OnChainState>;
}
