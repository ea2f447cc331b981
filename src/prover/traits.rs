//! Prover trait definition

use super::{Proof, Witness};
use crate::Result;

/// Contract to the opaque proving backend
///
/// Implementations can wrap:
/// - A local circuit compiler/prover process
/// - A remote proving service
/// - The deterministic [`MockProver`](super::MockProver) for tests
///
/// Both `ProofGenerationFailed` and `ProverUnavailable` are retryable by
/// the caller.
pub trait Prover: Send + Sync {
    /// Produce a proof for the witness
    fn prove(&self, witness: &Witness) -> Result<Proof>;

    /// Check a proof against the witness it claims to prove
    ///
    /// Default implementation only compares public-input commitments.
    fn verify(&self, witness: &Witness, proof: &Proof) -> bool {
        proof.commitment == witness.commitment()
    }

    /// Get the backend name/identifier
    fn name(&self) -> &str;
}
