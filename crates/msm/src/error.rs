use thiserror::Error;
use zkaccel_device_common::error::{DeviceError, MemCopyError, MemoryError, StreamError};

#[derive(Error, Debug, Clone)]
pub enum MsmError {
    #[error(
        "Size mismatch: {scalars} scalars and {points} points do not form {batch_size} MSM instance(s) with precompute factor {precompute_factor}"
    )]
    SizeMismatch {
        scalars: usize,
        points: usize,
        batch_size: usize,
        precompute_factor: usize,
    },

    #[error("Output holds {actual} results but {expected} MSM instance(s) were requested")]
    OutputSizeMismatch { expected: usize, actual: usize },

    #[error("Invalid MSM configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    MemCopy(#[from] MemCopyError),
}
