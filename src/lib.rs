//! # rollup_db
//!
//! A document database whose state is committed to a sparse Merkle tree,
//! with mutations proved and aggregated into rollup proofs that settle on
//! an external chain.
//!
//! ## Core Concepts
//!
//! - **Collections**: fixed-height sparse Merkle trees over document slots
//! - **Actions**: a gapless, hash-chained log of every mutation
//! - **Tasks**: one proof job per action, retried with backoff
//! - **Rollups**: runs of proved actions folded into one transition proof,
//!   reconciled against the chain's actual state
//!
//! ## Example
//!
//! ```ignore
//! use rollup_db::Database;
//!
//! let db = Database::in_memory()?;
//! db.create_collection("docs", Some(16))?;
//! db.insert("docs", 3, b"hello")?;
//! db.prove_pending("docs")?;
//! db.rollup_step("docs")?;
//! ```

pub mod chain;
pub mod collection;
pub mod config;
pub mod log;
pub mod merkle;
pub mod model;
pub mod prover;
pub mod queue;
pub mod rollup;
pub mod store;
pub mod worker;

mod database;
mod error;

pub use chain::{ChainClient, Confirmation, LocalChain, OnChainState, SubmissionHandle};
pub use collection::{Collection, CollectionStatus, Ledger};
pub use config::{BackendConfig, Config, RetryPolicy};
pub use database::Database;
pub use error::{Error, ErrorClass, Result};
pub use log::{ActionLog, Checkpoint};
pub use merkle::{verify_witness, MerkleStore, MerkleWitness};
pub use model::{Action, ActionKind, Hash, RollupRecord, RollupStatus, Task, TaskId, TaskStatus};
pub use prover::{MockProver, Proof, Prover, Witness};
pub use queue::TaskQueue;
pub use rollup::{RollupOutcome, RollupPhase, RollupProcessor};
pub use store::{Backend, FileBackend, MemoryBackend};
pub use worker::{PoolOptions, WorkerPool};

/// Database version for format compatibility
pub const VERSION: u32 = 1;

/// Magic bytes for file identification
pub const MAGIC: &[u8; 8] = b"ROLLUPDB";
