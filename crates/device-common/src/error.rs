use std::path::PathBuf;

use thiserror::Error;

use crate::{common::Device, memory_manager::DevicePtr, stream::StreamId};

/// Failure to discover or register compute backends. Fatal at startup.
#[derive(Error, Debug)]
pub enum BackendLoadError {
    #[error("backend directory {} does not exist", path.display())]
    MissingDirectory { path: PathBuf },

    #[error("failed to read backend directory {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse backend manifest {}: {source}", path.display())]
    Manifest {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("backend manifest {} failed integrity check: {reason}", path.display())]
    Integrity { path: PathBuf, reason: String },

    #[error("backend {name} is declared by more than one manifest")]
    Duplicate { name: String },

    #[error("no usable compute backend found")]
    NoBackends,
}

/// The backend/index pair was never registered.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("device {backend}:{index} was never registered")]
pub struct DeviceNotFound {
    pub backend: String,
    pub index: usize,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Invalid memory size: {size}")]
    InvalidMemorySize { size: usize },

    #[error(
        "Out of memory on {device} (size requested: {requested} bytes, available: {available} bytes)"
    )]
    OutOfMemory {
        device: Device,
        requested: usize,
        available: usize,
    },

    #[error("Device buffer {ptr} was already freed")]
    AlreadyFreed { ptr: DevicePtr },

    #[error("Device buffer {ptr} used after free")]
    UseAfterFree { ptr: DevicePtr },

    #[error("Device buffer {ptr} has outstanding work on stream {stream}; synchronize first")]
    AsyncNotReady { ptr: DevicePtr, stream: StreamId },

    #[error("Device buffer {ptr} lives on {buffer_device} but was used on {used_on}")]
    WrongDevice {
        ptr: DevicePtr,
        buffer_device: Device,
        used_on: Device,
    },
}

/// Backend-reported failure while executing work on a device.
#[derive(Error, Debug, Clone)]
pub enum DeviceError {
    #[error("kernel `{kernel}` failed on {device}: {message}")]
    KernelFailed {
        device: Device,
        kernel: &'static str,
        message: String,
    },

    #[error("kernel `{kernel}` panicked on {device}: {message}")]
    KernelPanicked {
        device: Device,
        kernel: &'static str,
        message: String,
    },

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

#[derive(Error, Debug, Clone)]
pub enum StreamError {
    #[error("stream {id} still has {outstanding} outstanding commands")]
    StreamBusy { id: StreamId, outstanding: u64 },

    #[error("stream {id} has been destroyed")]
    Destroyed { id: StreamId },

    #[error("stream {id} belongs to {stream_device}, not {expected}")]
    WrongDevice {
        id: StreamId,
        stream_device: Device,
        expected: Device,
    },

    #[error("stream {id} completed ticket {ticket} without producing a result")]
    MissingResult { id: StreamId, ticket: u64 },

    #[error("failed to spawn worker for stream {id}: {message}")]
    Spawn { id: StreamId, message: String },

    #[error("failed to build compute threads for {device}: {message}")]
    ComputePool { device: Device, message: String },

    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl From<MemoryError> for StreamError {
    fn from(err: MemoryError) -> Self {
        StreamError::Device(err.into())
    }
}

#[derive(Error, Debug, Clone)]
pub enum MemCopyError {
    #[error("Size mismatch in {operation}: host len={host_len}, device len={device_len}")]
    SizeMismatch {
        operation: &'static str,
        host_len: usize,
        device_len: usize,
    },

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Stream(#[from] StreamError),
}
