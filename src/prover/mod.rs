//! Pluggable proving backend

mod mock;
mod traits;
mod witness;

pub use mock::MockProver;
pub use traits::Prover;
pub use witness::{batch_commitment, ActionWitness, BatchWitness, Proof, Witness};
