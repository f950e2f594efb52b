use std::path::PathBuf;

use ark_relations::r1cs::SynthesisError;
use thiserror::Error;
use zkaccel_device_common::error::{BackendLoadError, DeviceNotFound};
use zkaccel_groth16::{ProverError, VerifierError};

#[derive(Error, Debug)]
pub enum SdkError {
    #[error("Failed to read engine config {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid engine config: {0}")]
    ConfigParse(#[from] toml::de::Error),
    #[error(transparent)]
    BackendLoad(#[from] BackendLoadError),
    #[error(transparent)]
    DeviceNotFound(#[from] DeviceNotFound),
    #[error(transparent)]
    Synthesis(#[from] SynthesisError),
    #[error(transparent)]
    Prover(#[from] ProverError),
    #[error(transparent)]
    Verifier(#[from] VerifierError),
}
