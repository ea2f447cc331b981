//! Mock prover for testing

use super::{Proof, Prover, Witness};
use crate::model::Hash;
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// A prover that checks the witness and returns a deterministic proof
///
/// Useful for testing without a real proving backend. The proof bytes are
/// BLAKE3 of the witness commitment, so same witness → same proof.
/// Failures can be injected to exercise the retry paths.
pub struct MockProver {
    available: AtomicBool,
    fail_next: AtomicU32,
    calls: AtomicU64,
}

impl MockProver {
    pub fn new() -> Self {
        MockProver {
            available: AtomicBool::new(true),
            fail_next: AtomicU32::new(0),
            calls: AtomicU64::new(0),
        }
    }

    /// Make the next `n` calls fail with `ProofGenerationFailed`
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Simulate the backend going away (or coming back)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of `prove` calls so far
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for MockProver {
    fn default() -> Self {
        Self::new()
    }
}

impl Prover for MockProver {
    fn prove(&self, witness: &Witness) -> Result<Proof> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if !self.available.load(Ordering::SeqCst) {
            return Err(Error::ProverUnavailable);
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::ProofGenerationFailed("injected failure".into()));
        }

        witness.check().map_err(Error::ProofGenerationFailed)?;

        let commitment = witness.commitment();
        let bytes = Hash::digest_many(&[b"mock-proof", commitment.as_bytes()]);
        Ok(Proof {
            bytes: bytes.as_bytes().to_vec(),
            commitment,
            prover: self.name().to_string(),
        })
    }

    fn name(&self) -> &str {
        "mock-prover"
    }
}
