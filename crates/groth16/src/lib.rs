//! Groth16 proving pipeline.
//!
//! Circuit compilation, trusted setup, the QAP witness map and pairing verification are
//! delegated to arkworks. This crate owns the part that dominates proving time: the five
//! multi-scalar multiplications over the proving key, which run on a [prover::ProverDevice],
//! and their combination into the proof elements.

pub mod error;
pub mod keygen;
pub mod proof;
pub mod prover;
pub mod test_utils;
pub mod verifier;
pub mod witness;

pub use ark_groth16::{Proof, ProvingKey, VerifyingKey};
pub use error::ProverError;
pub use keygen::{compile, setup, ConstraintSystem};
pub use verifier::{verify, VerifierError};
pub use witness::{PublicWitness, Witness};

/// Pairing engine used by default throughout the workspace.
pub type DefaultEngine = ark_bn254::Bn254;
