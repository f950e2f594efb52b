use ark_relations::r1cs::SynthesisError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProverError {
    #[error("Witness does not satisfy constraint {index}")]
    UnsatisfiedConstraints { index: usize },

    #[error(
        "Witness shape mismatch: expected {expected_instance} instance and {expected_witness} witness values, got {instance} and {witness}"
    )]
    WitnessShape {
        expected_instance: usize,
        expected_witness: usize,
        instance: usize,
        witness: usize,
    },

    #[error("Proving key does not match the constraint system: {0}")]
    KeyMismatch(String),

    #[error("Constraint synthesis failed: {0}")]
    Synthesis(#[from] SynthesisError),

    #[error("Constraint system has no matrices; compile it in setup mode")]
    MissingMatrices,

    #[error("Prover device failed: {0}")]
    Device(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl ProverError {
    pub fn device(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        ProverError::Device(Box::new(err))
    }
}
