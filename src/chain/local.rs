//! In-process settlement contract
//!
//! Mirrors what the on-chain contract enforces: a transition is accepted
//! only if it starts from the contract's current root and action state and
//! its proof commits to exactly that transition. Submissions settle in
//! arrival order, either on demand (`settle`) or on every confirmation
//! query when `auto_settle` is on.

use super::{ChainClient, Confirmation, OnChainState, SubmissionHandle};
use crate::model::{genesis_action_state, Hash, RollupRecord};
use crate::prover::batch_commitment;
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Submission {
    collection: String,
    previous: OnChainState,
    next: OnChainState,
    commitment: Hash,
    outcome: Confirmation,
}

/// Serializable contents of a [`LocalChain`]
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LocalChainState {
    contracts: BTreeMap<String, OnChainState>,
    submissions: BTreeMap<u64, Submission>,
    next_id: u64,
}

/// A deterministic stand-in for the settlement chain
pub struct LocalChain {
    state: Mutex<LocalChainState>,
    auto_settle: bool,
}

impl LocalChain {
    /// Chain that settles only when [`settle`](Self::settle) is called
    pub fn new() -> Self {
        Self::from_state(LocalChainState::default(), false)
    }

    /// Chain that settles pending submissions whenever one is queried
    pub fn auto_settling() -> Self {
        Self::from_state(LocalChainState::default(), true)
    }

    pub fn from_state(state: LocalChainState, auto_settle: bool) -> Self {
        LocalChain {
            state: Mutex::new(state),
            auto_settle,
        }
    }

    pub fn snapshot(&self) -> LocalChainState {
        self.state.lock().clone()
    }

    pub fn is_deployed(&self, collection: &str) -> bool {
        self.state.lock().contracts.contains_key(collection)
    }

    /// Force the contract state, as a competing submitter would
    pub fn override_state(&self, collection: &str, state: OnChainState) {
        self.state
            .lock()
            .contracts
            .insert(collection.to_string(), state);
    }

    /// Settle every pending submission in arrival order; returns how many
    /// were decided
    pub fn settle(&self) -> usize {
        let mut guard = self.state.lock();
        let LocalChainState {
            contracts,
            submissions,
            ..
        } = &mut *guard;

        let mut decided = 0;
        for (id, submission) in submissions.iter_mut() {
            if submission.outcome != Confirmation::Pending {
                continue;
            }
            decided += 1;

            let Some(current) = contracts.get_mut(&submission.collection) else {
                submission.outcome = Confirmation::Rejected("no contract deployed".into());
                continue;
            };
            let expected = batch_commitment(
                &submission.collection,
                &submission.previous.root,
                &submission.next.root,
                &submission.previous.action_state,
                &submission.next.action_state,
            );

            submission.outcome = if submission.commitment != expected {
                Confirmation::Rejected("proof does not commit to the transition".into())
            } else if *current != submission.previous {
                Confirmation::Rejected(format!(
                    "stale base: contract root is {}",
                    current.root.short()
                ))
            } else {
                *current = submission.next;
                Confirmation::Confirmed {
                    root: submission.next.root,
                    action_state: submission.next.action_state,
                }
            };
            debug!(submission = id, outcome = ?submission.outcome, "settled submission");
        }
        decided
    }
}

impl Default for LocalChain {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainClient for LocalChain {
    fn deploy(&self, collection: &str, genesis_root: Hash) -> Result<()> {
        self.state
            .lock()
            .contracts
            .entry(collection.to_string())
            .or_insert(OnChainState {
                root: genesis_root,
                action_state: genesis_action_state(),
            });
        Ok(())
    }

    fn submit(&self, record: &RollupRecord) -> Result<SubmissionHandle> {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.submissions.insert(
            id,
            Submission {
                collection: record.collection.clone(),
                previous: OnChainState {
                    root: record.previous_root,
                    action_state: record.previous_action_state,
                },
                next: OnChainState {
                    root: record.new_root,
                    action_state: record.new_action_state,
                },
                commitment: record.proof.commitment,
                outcome: Confirmation::Pending,
            },
        );
        Ok(SubmissionHandle {
            collection: record.collection.clone(),
            id,
        })
    }

    fn query_confirmation(&self, handle: &SubmissionHandle) -> Result<Confirmation> {
        if self.auto_settle {
            self.settle();
        }
        let state = self.state.lock();
        state
            .submissions
            .get(&handle.id)
            .filter(|s| s.collection == handle.collection)
            .map(|s| s.outcome.clone())
            .ok_or_else(|| Error::Chain(format!("unknown submission {}", handle.id)))
    }

    fn current_state(&self, collection: &str) -> Result<OnChainState> {
        self.state
            .lock()
            .contracts
            .get(collection)
            .copied()
            .ok_or_else(|| Error::Chain(format!("no contract deployed for {}", collection)))
    }
}
