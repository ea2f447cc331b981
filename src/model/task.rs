//! Task type - one unit of proof work handed to a worker

use super::{now_millis, Action};
use crate::prover::{ActionWitness, Proof};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a task within its collection's queue
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a task
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Queued,
    Proving,
    Proved,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Proving => "proving",
            TaskStatus::Proved => "proved",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Proved | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a proving attempt ended without a proof
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    ProofGenerationFailed(String),
    ProverUnavailable,
    /// Cancelled by an operator or by dropping the collection; never retried
    Cancelled,
}

impl FailureReason {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureReason::Cancelled)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::ProofGenerationFailed(reason) => {
                write!(f, "proof generation failed: {}", reason)
            }
            FailureReason::ProverUnavailable => f.write_str("prover unavailable"),
            FailureReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

impl From<&crate::Error> for FailureReason {
    fn from(err: &crate::Error) -> Self {
        match err {
            crate::Error::ProverUnavailable => FailureReason::ProverUnavailable,
            crate::Error::ProofGenerationFailed(reason) => {
                FailureReason::ProofGenerationFailed(reason.clone())
            }
            other => FailureReason::ProofGenerationFailed(other.to_string()),
        }
    }
}

/// A proof task for a single action
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub action: Action,
    /// Pre/post state of the action, captured when it was appended
    pub witness: ActionWitness,
    pub status: TaskStatus,
    /// Failed proving attempts so far
    pub attempts: u32,
    /// Creation time (unix millis)
    pub created_at: u64,
    /// Earliest time the task may be dequeued again (unix millis)
    pub not_before: u64,
    pub proof: Option<Proof>,
    pub failure: Option<FailureReason>,
}

impl Task {
    pub fn new(id: TaskId, action: Action, witness: ActionWitness) -> Self {
        let now = now_millis();
        Task {
            id,
            action,
            witness,
            status: TaskStatus::Queued,
            attempts: 0,
            created_at: now,
            not_before: now,
            proof: None,
            failure: None,
        }
    }

    /// Sequence number of the task's action
    pub fn sequence(&self) -> u64 {
        self.action.sequence
    }

    /// Whether a worker may pick this task up at `now`
    pub fn is_eligible(&self, now: u64) -> bool {
        self.status == TaskStatus::Queued && self.not_before <= now
    }
}
