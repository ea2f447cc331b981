//! Action log
//!
//! The ordered history of pending mutations for a collection, plus the
//! action-state chain `state_n = H(state_{n-1}, H(action_n))` that the
//! on-chain contract tracks as its last processed action state.

mod action_log;

pub use action_log::{replay_action_state, ActionLog, Checkpoint, LogEntry};
