//! Core data model types for rollup_db

mod action;
mod hash;
mod rollup;
mod task;

pub use action::{genesis_action_state, next_action_state, Action, ActionKind};
pub use hash::Hash;
pub use rollup::{RollupRecord, RollupStatus};
pub use task::{FailureReason, Task, TaskId, TaskStatus};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as unix millis
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
