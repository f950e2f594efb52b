use std::{
    collections::HashMap,
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};

use crate::{
    common::{Device, DeviceContext},
    error::MemoryError,
};

#[cfg(test)]
mod tests;

static METRICS_SEQ: AtomicU64 = AtomicU64::new(0);

/// Allocation granularity; every device address is a multiple of this.
pub const ALLOC_ALIGNMENT: u64 = 256;

/// Opaque address of an allocation in device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DevicePtr(u64);

impl DevicePtr {
    pub fn addr(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Per-device slab bookkeeping: which addresses are live, how many bytes they hold, and the
/// capacity they are carved from.
pub struct MemoryManager {
    device: Device,
    capacity: usize,
    allocated_ptrs: HashMap<DevicePtr, usize>,
    next_addr: u64,
    current_size: usize,
    max_used_size: usize,
}

impl MemoryManager {
    pub fn new(device: Device, capacity: usize) -> Self {
        tracing::debug!(%device, capacity = %ByteSize::b(capacity as u64), "memory manager initialized");
        Self {
            device,
            capacity,
            allocated_ptrs: HashMap::new(),
            next_addr: ALLOC_ALIGNMENT,
            current_size: 0,
            max_used_size: 0,
        }
    }

    pub(crate) fn d_malloc(&mut self, size: usize) -> Result<DevicePtr, MemoryError> {
        assert!(size != 0, "Requested size must be non-zero");

        let available = self.capacity - self.current_size;
        if size > available {
            return Err(MemoryError::OutOfMemory {
                device: self.device.clone(),
                requested: size,
                available,
            });
        }

        let ptr = DevicePtr(self.next_addr);
        self.next_addr += (size as u64).next_multiple_of(ALLOC_ALIGNMENT);
        self.allocated_ptrs.insert(ptr, size);

        self.current_size += size;
        if self.current_size > self.max_used_size {
            self.max_used_size = self.current_size;
        }
        Ok(ptr)
    }

    /// Releases `ptr` and returns the number of bytes it held.
    pub(crate) fn d_free(&mut self, ptr: DevicePtr) -> Result<usize, MemoryError> {
        let size = self
            .allocated_ptrs
            .remove(&ptr)
            .ok_or(MemoryError::AlreadyFreed { ptr })?;
        self.current_size -= size;
        Ok(size)
    }

    pub fn is_live(&self, ptr: DevicePtr) -> bool {
        self.allocated_ptrs.contains_key(&ptr)
    }

    pub fn num_allocations(&self) -> usize {
        self.allocated_ptrs.len()
    }

    pub fn snapshot(&self) -> MemSnapshot {
        MemSnapshot {
            current: self.current_size,
            peak: self.max_used_size,
            capacity: self.capacity,
        }
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        if !self.allocated_ptrs.is_empty() {
            tracing::error!(
                device = %self.device,
                "{} allocations were still live when the memory manager was dropped",
                self.allocated_ptrs.len()
            );
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemSnapshot {
    pub current: usize,
    pub peak: usize,
    pub capacity: usize,
}

impl MemSnapshot {
    pub fn available(&self) -> usize {
        self.capacity - self.current
    }
}

/// Tracks memory usage of one device across a labelled region of code.
#[derive(Debug, Clone)]
pub struct MemTracker {
    ctx: DeviceContext,
    start_current: usize,
    start_peak: usize,
    label: &'static str,
}

impl MemTracker {
    pub fn start(ctx: &DeviceContext, label: &'static str) -> Self {
        let snapshot = ctx.mem_snapshot();
        Self {
            ctx: ctx.clone(),
            start_current: snapshot.current,
            start_peak: snapshot.peak,
            label,
        }
    }

    pub fn emit_metrics(&self) {
        let snapshot = self.ctx.mem_snapshot();
        let seq = METRICS_SEQ.fetch_add(1, Ordering::Relaxed);
        let delta = snapshot.current as isize - self.start_current as isize;
        // Peak reached during this region
        let region_peak = snapshot.peak.saturating_sub(self.start_peak);
        let device = self.ctx.device().to_string();

        metrics::gauge!("device_mem.seq", "module" => self.label).set(seq as f64);
        metrics::gauge!("device_mem.current_bytes", "module" => self.label)
            .set(snapshot.current as f64);
        metrics::gauge!("device_mem.delta_bytes", "module" => self.label).set(delta as f64);
        metrics::gauge!("device_mem.module_peak_bytes", "module" => self.label)
            .set(region_peak as f64);

        metrics::gauge!("device_mem.peak_bytes", "device" => device.clone())
            .set(snapshot.peak as f64);
        metrics::gauge!("device_mem.capacity_bytes", "device" => device)
            .set(snapshot.capacity as f64);
    }

    #[inline]
    pub fn tracing_info(&self, msg: impl Into<Option<&'static str>>) {
        let snapshot = self.ctx.mem_snapshot();
        let used = snapshot.current as isize - self.start_current as isize;
        let sign = if used >= 0 { "+" } else { "-" };
        tracing::info!(
            "{} mem: used={}{}, current={}, peak={}, capacity={} ({})",
            self.ctx.device(),
            sign,
            ByteSize::b(used.unsigned_abs() as u64),
            ByteSize::b(snapshot.current as u64),
            ByteSize::b(snapshot.peak as u64),
            ByteSize::b(snapshot.capacity as u64),
            msg.into()
                .map_or(self.label.to_string(), |m| format!("{}:{}", self.label, m))
        );
    }
}

impl Drop for MemTracker {
    fn drop(&mut self) {
        self.tracing_info(None);
    }
}
