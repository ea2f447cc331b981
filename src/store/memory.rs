//! In-memory backend. Nothing survives the process.

use super::{Backend, Blob};
use crate::Result;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Volatile backend for tests and throwaway databases
#[derive(Default)]
pub struct MemoryBackend {
    blobs: RwLock<HashMap<String, Blob>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MemoryBackend {
    fn put(&self, key: &str, blob: &Blob) -> Result<()> {
        self.blobs.write().insert(key.to_string(), blob.clone());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Blob>> {
        Ok(self.blobs.read().get(key).cloned())
    }

    fn exists(&self, key: &str) -> bool {
        self.blobs.read().contains_key(key)
    }

    fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.blobs.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.blobs.write().remove(key).is_some())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
