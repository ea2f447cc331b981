//! Proof task queue
//!
//! One task per appended action. Workers pull tasks, prove them and report
//! back; failures are retried with exponential backoff until the budget is
//! spent, after which the task stays `Failed` for an operator.

mod task_queue;

pub use task_queue::{ProvedRun, QueueState, TaskChanges, TaskCounts, TaskQueue};
