use std::{fmt, sync::Arc};

use derive_new::new;
use getset::{CopyGetters, Getters};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::{
    error::StreamError,
    memory_manager::{MemSnapshot, MemoryManager},
    stream::Stream,
};

/// Kind of compute backend a device belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Host CPU; executes kernels on the calling or stream worker thread.
    Cpu,
    /// Accelerator device with its own memory budget.
    Accelerator,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Cpu => write!(f, "cpu"),
            BackendKind::Accelerator => write!(f, "accelerator"),
        }
    }
}

/// A backend name plus the index of the device among that backend's devices.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Getters,
    CopyGetters, new,
)]
pub struct Device {
    #[getset(get = "pub")]
    backend: String,
    #[getset(get_copy = "pub")]
    index: usize,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.backend, self.index)
    }
}

/// Per-device state shared by every context that activates the device.
pub(crate) struct DeviceRuntime {
    pub(crate) device: Device,
    pub(crate) kind: BackendKind,
    pub(crate) memory: Arc<Mutex<MemoryManager>>,
    /// Threads that execute this device's kernels, built on first stream creation.
    compute: Mutex<Option<Arc<ThreadPool>>>,
}

impl DeviceRuntime {
    pub(crate) fn new(device: Device, kind: BackendKind, capacity: usize) -> Self {
        let memory = Arc::new(Mutex::new(MemoryManager::new(device.clone(), capacity)));
        Self {
            device,
            kind,
            memory,
            compute: Mutex::new(None),
        }
    }

    /// Kernels never run on the caller's rayon pool, so a host thread blocked on a stream
    /// cannot starve the work it waits for.
    fn compute_pool(&self) -> Result<Arc<ThreadPool>, StreamError> {
        let mut compute = self.compute.lock();
        if let Some(pool) = compute.as_ref() {
            return Ok(pool.clone());
        }
        let name = self.device.to_string();
        let pool = ThreadPoolBuilder::new()
            .thread_name(move |i| format!("{name}-compute-{i}"))
            .build()
            .map_err(|e| StreamError::ComputePool {
                device: self.device.clone(),
                message: e.to_string(),
            })?;
        tracing::debug!(
            device = %self.device,
            threads = pool.current_num_threads(),
            "built device compute pool"
        );
        let pool = Arc::new(pool);
        *compute = Some(pool.clone());
        Ok(pool)
    }
}

/// The active device of one execution context.
///
/// Every device-touching call takes a context explicitly; there is no ambient "current device".
/// Cloning is cheap and clones address the same device, but streams and buffers created from a
/// context stay owned by whoever created them.
#[derive(Clone)]
pub struct DeviceContext {
    runtime: Arc<DeviceRuntime>,
}

impl DeviceContext {
    pub(crate) fn new(runtime: Arc<DeviceRuntime>) -> Self {
        Self { runtime }
    }

    pub fn device(&self) -> &Device {
        &self.runtime.device
    }

    pub fn kind(&self) -> BackendKind {
        self.runtime.kind
    }

    pub fn is_accelerator(&self) -> bool {
        self.runtime.kind == BackendKind::Accelerator
    }

    /// Creates a new command queue bound to this device.
    pub fn create_stream(&self) -> Result<Stream, StreamError> {
        Stream::new(
            self.runtime.device.clone(),
            self.runtime.kind,
            self.runtime.compute_pool()?,
        )
    }

    /// Current, peak and capacity figures of this device's memory.
    pub fn mem_snapshot(&self) -> MemSnapshot {
        self.runtime.memory.lock().snapshot()
    }

    pub(crate) fn memory(&self) -> &Arc<Mutex<MemoryManager>> {
        &self.runtime.memory
    }

    pub fn check_stream(&self, stream: &Stream) -> Result<(), StreamError> {
        if stream.device() != self.device() {
            return Err(StreamError::WrongDevice {
                id: stream.id(),
                stream_device: stream.device().clone(),
                expected: self.device().clone(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("device", &self.runtime.device)
            .field("kind", &self.runtime.kind)
            .finish()
    }
}
