use ark_serialize::SerializationError;
use thiserror::Error;
use zkaccel_device_common::error::{MemCopyError, StreamError};
use zkaccel_msm::MsmError;

#[derive(Error, Debug)]
pub enum GpuProverError {
    #[error("MSM: {0}")]
    Msm(#[from] MsmError),
    #[error("MemCopy: {0}")]
    MemCopy(#[from] MemCopyError),
    #[error("Stream: {0}")]
    Stream(#[from] StreamError),
    #[error("Proving key fingerprint: {0}")]
    Fingerprint(#[from] SerializationError),
}
