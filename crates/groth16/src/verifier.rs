use ark_ec::pairing::Pairing;
use ark_groth16::{Groth16, Proof, VerifyingKey};
use ark_relations::r1cs::SynthesisError;
use ark_snark::SNARK;
use thiserror::Error;
use tracing::instrument;

use crate::witness::PublicWitness;

#[derive(Error, Debug)]
pub enum VerifierError {
    #[error("Proof verification failed")]
    VerificationFailed,
    #[error("Verifying key expects {expected} public inputs, got {actual}")]
    PublicInputCount { expected: usize, actual: usize },
    #[error("Verification error: {0}")]
    Synthesis(#[from] SynthesisError),
}

/// Pairing check of `proof` against `vk` and the public inputs.
#[instrument(name = "groth16_verify", level = "info", skip_all)]
pub fn verify<E: Pairing>(
    proof: &Proof<E>,
    vk: &VerifyingKey<E>,
    public: &PublicWitness<E::ScalarField>,
) -> Result<(), VerifierError> {
    let expected = vk.gamma_abc_g1.len().saturating_sub(1);
    if public.values().len() != expected {
        return Err(VerifierError::PublicInputCount {
            expected,
            actual: public.values().len(),
        });
    }
    if Groth16::<E>::verify(vk, public.values(), proof)? {
        Ok(())
    } else {
        Err(VerifierError::VerificationFailed)
    }
}
