//! Error types for rollup_db

use thiserror::Error;

/// Result type alias for rollup_db operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`], used by callers to decide
/// whether to retry, surface to an operator, or abort.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Rejected before any state change
    Validation,
    /// Lost a race; the caller may retry
    Concurrency,
    /// Proving backend failure, retried under the task budget
    Proving,
    /// Local and on-chain state disagree
    ChainDivergence,
    /// Persisted state cannot be trusted
    Fatal,
    /// Storage or encoding failure
    Io,
}

/// Errors that can occur in rollup_db operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The change is applied in memory but was not written; the next
    /// successful save of the collection writes it
    #[error("Action {sequence} applied but not saved: {source}")]
    NotPersisted {
        sequence: u64,
        #[source]
        source: Box<Error>,
    },

    // === Validation ===
    #[error("Invalid tree height {height} (allowed 1..={max})")]
    InvalidHeight { height: u8, max: u8 },

    #[error("Leaf index {index} out of range for height {height}")]
    IndexOutOfRange { index: u64, height: u8 },

    #[error("Unknown sequence number: {0}")]
    UnknownSequence(u64),

    #[error("Document already exists at index {0}")]
    DocumentExists(u64),

    #[error("No document at index {0}")]
    DocumentNotFound(u64),

    #[error("Collection already exists: {0}")]
    CollectionExists(String),

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    // === Concurrency ===
    #[error("Sequence slot {expected} already taken (next is {actual})")]
    ConcurrentAppendConflict { expected: u64, actual: u64 },

    #[error("A rollup is already in flight for collection {0}")]
    RollupAlreadyInFlight(String),

    #[error("Invalid task transition for task {task}: {from} -> {to}")]
    InvalidTransition {
        task: u64,
        from: &'static str,
        to: &'static str,
    },

    #[error("Task not found: {0}")]
    TaskNotFound(u64),

    // === Proving ===
    #[error("Proof generation failed: {0}")]
    ProofGenerationFailed(String),

    #[error("Prover unavailable")]
    ProverUnavailable,

    // === Chain ===
    #[error("On-chain state (root {root}, action state {action_state}) is not in local history")]
    ChainDivergence { root: String, action_state: String },

    #[error("Chain error: {0}")]
    Chain(String),

    // === Fatal ===
    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Height mismatch: persisted {persisted}, expected {expected}")]
    HeightMismatch { persisted: u8, expected: u8 },

    #[error("Invalid database file: {0}")]
    InvalidFile(String),

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("Config error: {0}")]
    Config(String),
}

impl Error {
    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::InvalidHeight { .. }
            | Error::IndexOutOfRange { .. }
            | Error::UnknownSequence(_)
            | Error::DocumentExists(_)
            | Error::DocumentNotFound(_)
            | Error::CollectionExists(_)
            | Error::CollectionNotFound(_)
            | Error::Config(_) => ErrorClass::Validation,
            Error::ConcurrentAppendConflict { .. }
            | Error::RollupAlreadyInFlight(_)
            | Error::InvalidTransition { .. }
            | Error::TaskNotFound(_) => ErrorClass::Concurrency,
            Error::ProofGenerationFailed(_) | Error::ProverUnavailable => ErrorClass::Proving,
            Error::ChainDivergence { .. } | Error::Chain(_) => ErrorClass::ChainDivergence,
            Error::Corruption(_)
            | Error::HeightMismatch { .. }
            | Error::InvalidFile(_)
            | Error::VersionMismatch { .. } => ErrorClass::Fatal,
            Error::Io(_)
            | Error::Serialization(_)
            | Error::Json(_)
            | Error::NotPersisted { .. } => ErrorClass::Io,
        }
    }

    /// Whether the proving pipeline should retry after this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ProofGenerationFailed(_) | Error::ProverUnavailable
        )
    }

    /// Whether this error means persisted state must not be served
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }
}
