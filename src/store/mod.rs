//! Persistence backends
//!
//! State is persisted as typed, zstd-compressed blobs under string keys.
//! The database only needs `put`/`get`/`exists`; the rest is for listing
//! collections, dropping them and flushing.

mod blob;
mod file_store;
mod memory;

pub use blob::{Blob, BlobType};
pub use file_store::FileBackend;
pub use memory::MemoryBackend;

use crate::config::{BackendConfig, Config};
use crate::Result;

/// Key/value storage capability
pub trait Backend: Send + Sync {
    /// Store a blob under `key`, replacing any previous value
    fn put(&self, key: &str, blob: &Blob) -> Result<()>;

    fn get(&self, key: &str) -> Result<Option<Blob>>;

    fn exists(&self, key: &str) -> bool;

    /// All keys, sorted
    fn keys(&self) -> Vec<String>;

    /// Returns whether the key was present
    fn remove(&self, key: &str) -> Result<bool>;

    /// Make previous writes durable
    fn sync(&self) -> Result<()>;
}

/// Build the backend named by the configuration
pub fn open_backend(config: &Config) -> Result<Box<dyn Backend>> {
    Ok(match &config.backend {
        BackendConfig::Memory => Box::new(MemoryBackend::new()),
        BackendConfig::File { path } => Box::new(FileBackend::open_or_create(path)?),
    })
}
