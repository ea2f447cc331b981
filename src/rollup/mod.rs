//! Rollup aggregation and settlement
//!
//! The processor folds the contiguous run of proved actions after the
//! confirmed checkpoint into one transition proof, submits it, and
//! reconciles the outcome with the chain. Rejections and confirmations of
//! an unexpected state trigger divergence repair: the checkpoint is moved
//! to wherever the chain actually is in local history, or the collection
//! is blocked if the chain holds a state this node never produced.

mod processor;

pub use processor::{
    LocalHistory, RollupEnv, RollupOutcome, RollupPhase, RollupProcessor, RollupSettings,
    RollupState,
};
