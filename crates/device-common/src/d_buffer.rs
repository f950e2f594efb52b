use std::{collections::HashMap, fmt, mem::size_of, sync::Arc};

use parking_lot::{
    MappedRwLockReadGuard, MappedRwLockWriteGuard, Mutex, RwLock, RwLockReadGuard,
    RwLockWriteGuard,
};

use crate::{
    common::{Device, DeviceContext},
    error::{MemoryError, StreamError},
    memory_manager::DevicePtr,
    stream::{KernelContext, Pending, Stream, StreamId, StreamShared},
};

/// Element types that may live in device memory.
pub trait DeviceRepr: Clone + Default + Send + Sync + 'static {}

impl<T: Clone + Default + Send + Sync + 'static> DeviceRepr for T {}

/// Host-visible state of a device allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// No enqueued work writes the buffer.
    Ready,
    /// `outstanding` enqueued commands on `stream` still write the buffer.
    Pending { stream: StreamId, outstanding: usize },
    Freed,
}

#[derive(Default)]
pub(crate) struct Access {
    freed: bool,
    writer: Option<(StreamId, usize)>,
    readers: HashMap<StreamId, usize>,
}

impl Access {
    fn state(&self) -> BufferState {
        if self.freed {
            BufferState::Freed
        } else if let Some((stream, outstanding)) = self.writer {
            BufferState::Pending {
                stream,
                outstanding,
            }
        } else {
            BufferState::Ready
        }
    }

    fn other_reader(&self, stream: StreamId) -> Option<StreamId> {
        self.readers
            .iter()
            .find(|(id, count)| **id != stream && **count > 0)
            .map(|(id, _)| *id)
    }
}

/// Shared handle to a buffer's access state, held for each enqueued write.
pub(crate) type WriterMark = Arc<Mutex<Access>>;

/// Drops one write of `stream` from the buffer behind `mark`.
pub(crate) fn release_writer(mark: &Mutex<Access>, stream: StreamId) {
    let mut access = mark.lock();
    access.writer = match access.writer {
        Some((writer, n)) if writer == stream && n > 1 => Some((writer, n - 1)),
        Some((writer, _)) if writer == stream => None,
        other => other,
    };
}

struct DeviceCell<T> {
    data: RwLock<Vec<T>>,
    access: WriterMark,
}

/// A fixed-length typed allocation in device memory.
///
/// The contents are never exposed to host code directly: they are read and written by kernels
/// through [DeviceBufferView]s, or moved with the copy traits in [crate::copy].
pub struct DeviceBuffer<T: DeviceRepr> {
    ptr: DevicePtr,
    len: usize,
    ctx: DeviceContext,
    cell: Arc<DeviceCell<T>>,
}

impl<T: DeviceRepr> DeviceBuffer<T> {
    /// Allocates `len` elements on the context's device.
    ///
    /// Panics if `len` is zero.
    pub fn with_capacity(ctx: &DeviceContext, len: usize) -> Result<Self, MemoryError> {
        assert!(len != 0, "Zero-length device allocations are not supported");
        let size_bytes = len
            .checked_mul(size_of::<T>().max(1))
            .ok_or(MemoryError::InvalidMemorySize { size: usize::MAX })?;
        let ptr = ctx.memory().lock().d_malloc(size_bytes)?;
        tracing::trace!(%ptr, len, device = %ctx.device(), "allocated device buffer");

        Ok(Self {
            ptr,
            len,
            ctx: ctx.clone(),
            cell: Arc::new(DeviceCell {
                data: RwLock::new(vec![T::default(); len]),
                access: Arc::new(Mutex::new(Access::default())),
            }),
        })
    }

    /// Allocates `len` elements with the initialization ordered on `stream`.
    ///
    /// The buffer is usable by later work on the same stream right away, and by the host once
    /// the returned handle is waited on.
    pub fn with_capacity_async<'s>(
        ctx: &DeviceContext,
        len: usize,
        stream: &'s Stream,
    ) -> Result<Pending<'s, Self>, StreamError> {
        ctx.check_stream(stream)?;
        let mut buffer = Self::with_capacity(ctx, len)?;
        let view = buffer.view_mut(stream)?;
        let ticket = stream.enqueue("memset", move |kernel| {
            view.write(kernel).fill(T::default());
            Ok(())
        })?;
        Ok(stream.pending(ticket, buffer))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub fn device(&self) -> &Device {
        self.ctx.device()
    }

    pub fn context(&self) -> &DeviceContext {
        &self.ctx
    }

    pub fn size_bytes(&self) -> usize {
        self.len * size_of::<T>()
    }

    pub fn state(&self) -> BufferState {
        self.cell.access.lock().state()
    }

    /// Releases the allocation. A second call reports [MemoryError::AlreadyFreed].
    pub fn free(&mut self) -> Result<(), MemoryError> {
        {
            let mut access = self.cell.access.lock();
            if access.freed {
                return Err(MemoryError::AlreadyFreed { ptr: self.ptr });
            }
            debug_assert!(
                access.writer.is_none() && access.readers.values().all(|c| *c == 0),
                "device buffer {} freed with outstanding asynchronous work",
                self.ptr
            );
            access.freed = true;
        }
        self.ctx.memory().lock().d_free(self.ptr)?;
        tracing::trace!(ptr = %self.ptr, device = %self.ctx.device(), "freed device buffer");
        Ok(())
    }

    /// Read access for a kernel enqueued on `stream`.
    pub fn view(&self, stream: &Stream) -> Result<DeviceBufferView<T>, MemoryError> {
        self.check_device(stream)?;
        let mut access = self.cell.access.lock();
        self.check_live(&access)?;
        if let Some((writer, _)) = access.writer {
            if writer != stream.id() {
                return Err(MemoryError::AsyncNotReady {
                    ptr: self.ptr,
                    stream: writer,
                });
            }
        }
        *access.readers.entry(stream.id()).or_default() += 1;
        Ok(DeviceBufferView {
            cell: self.cell.clone(),
            stream: stream.id(),
            len: self.len,
        })
    }

    /// Write access for a kernel enqueued on `stream`.
    ///
    /// Until that kernel has run, the buffer is [BufferState::Pending] and cannot be touched by
    /// the host or by other streams. If the kernel fails the buffer stays pending until the
    /// failure is reported by a synchronization of `stream`.
    pub fn view_mut(&mut self, stream: &Stream) -> Result<DeviceBufferViewMut<T>, MemoryError> {
        self.check_device(stream)?;
        let mut access = self.cell.access.lock();
        self.check_live(&access)?;
        let busy = match access.writer {
            Some((writer, _)) if writer != stream.id() => Some(writer),
            _ => access.other_reader(stream.id()),
        };
        if let Some(busy) = busy {
            return Err(MemoryError::AsyncNotReady {
                ptr: self.ptr,
                stream: busy,
            });
        }
        let outstanding = access.writer.map_or(0, |(_, n)| n);
        access.writer = Some((stream.id(), outstanding + 1));
        Ok(DeviceBufferViewMut {
            cell: self.cell.clone(),
            stream: stream.shared().clone(),
            len: self.len,
        })
    }

    /// Host read of the contents. Requires that no enqueued work writes the buffer.
    pub(crate) fn host_read(&self) -> Result<MappedRwLockReadGuard<'_, [T]>, MemoryError> {
        let access = self.cell.access.lock();
        self.check_live(&access)?;
        if let Some((stream, _)) = access.writer {
            return Err(MemoryError::AsyncNotReady {
                ptr: self.ptr,
                stream,
            });
        }
        drop(access);
        Ok(RwLockReadGuard::map(self.cell.data.read(), |v| v.as_slice()))
    }

    /// Host write of the contents. Requires that no enqueued work references the buffer.
    pub(crate) fn host_write(&mut self) -> Result<MappedRwLockWriteGuard<'_, [T]>, MemoryError> {
        let access = self.cell.access.lock();
        self.check_live(&access)?;
        let busy = access
            .writer
            .map(|(stream, _)| stream)
            .or_else(|| access.other_reader(StreamId::MAX));
        if let Some(stream) = busy {
            return Err(MemoryError::AsyncNotReady {
                ptr: self.ptr,
                stream,
            });
        }
        drop(access);
        Ok(RwLockWriteGuard::map(self.cell.data.write(), |v| {
            v.as_mut_slice()
        }))
    }

    fn check_device(&self, stream: &Stream) -> Result<(), MemoryError> {
        if stream.device() != self.ctx.device() {
            return Err(MemoryError::WrongDevice {
                ptr: self.ptr,
                buffer_device: self.ctx.device().clone(),
                used_on: stream.device().clone(),
            });
        }
        Ok(())
    }

    fn check_live(&self, access: &Access) -> Result<(), MemoryError> {
        if access.freed {
            debug_assert!(false, "use of freed device buffer {}", self.ptr);
            return Err(MemoryError::UseAfterFree { ptr: self.ptr });
        }
        Ok(())
    }
}

impl<T: DeviceRepr> Drop for DeviceBuffer<T> {
    fn drop(&mut self) {
        let was_freed = std::mem::replace(&mut self.cell.access.lock().freed, true);
        if !was_freed {
            if let Err(err) = self.ctx.memory().lock().d_free(self.ptr) {
                tracing::error!("failed to free device buffer {}: {err}", self.ptr);
            }
        }
    }
}

impl<T: DeviceRepr> fmt::Debug for DeviceBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DeviceBuffer<{}> {{ ptr: {}, len: {}, device: {} }}",
            std::any::type_name::<T>(),
            self.ptr,
            self.len,
            self.ctx.device()
        )
    }
}

/// Shared access to a buffer, held by one enqueued kernel.
pub struct DeviceBufferView<T> {
    cell: Arc<DeviceCell<T>>,
    stream: StreamId,
    len: usize,
}

impl<T> DeviceBufferView<T> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn read<'a>(&'a self, _ctx: &'a KernelContext) -> MappedRwLockReadGuard<'a, [T]> {
        RwLockReadGuard::map(self.cell.data.read(), |v| v.as_slice())
    }
}

impl<T> Drop for DeviceBufferView<T> {
    fn drop(&mut self) {
        let mut access = self.cell.access.lock();
        if let Some(count) = access.readers.get_mut(&self.stream) {
            *count -= 1;
            if *count == 0 {
                access.readers.remove(&self.stream);
            }
        }
    }
}

/// Exclusive access to a buffer, held by one enqueued kernel.
pub struct DeviceBufferViewMut<T> {
    cell: Arc<DeviceCell<T>>,
    stream: Arc<StreamShared>,
    len: usize,
}

impl<T> DeviceBufferViewMut<T> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn read<'a>(&'a self, _ctx: &'a KernelContext) -> MappedRwLockReadGuard<'a, [T]> {
        RwLockReadGuard::map(self.cell.data.read(), |v| v.as_slice())
    }

    pub fn write<'a>(&'a self, _ctx: &'a KernelContext) -> MappedRwLockWriteGuard<'a, [T]> {
        RwLockWriteGuard::map(self.cell.data.write(), |v| v.as_mut_slice())
    }
}

impl<T> Drop for DeviceBufferViewMut<T> {
    fn drop(&mut self) {
        self.stream.release_after_command(self.cell.access.clone());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::{error::DeviceError, registry::BackendRegistry};

    fn cpu_context(capacity: usize) -> DeviceContext {
        let registry = BackendRegistry::with_builtin_cpu(capacity);
        let device = registry.create_device("CPU", 0).unwrap();
        registry.set_active_device(&device).unwrap()
    }

    #[test]
    fn test_drop_releases_memory() {
        let ctx = cpu_context(1 << 16);
        {
            let buf = DeviceBuffer::<u64>::with_capacity(&ctx, 128).unwrap();
            assert_eq!(ctx.mem_snapshot().current, buf.size_bytes());
        }
        assert_eq!(ctx.mem_snapshot().current, 0);
        assert_eq!(ctx.mem_snapshot().peak, 128 * 8);
    }

    #[test]
    fn test_double_free() {
        let ctx = cpu_context(1 << 16);
        let mut buf = DeviceBuffer::<u32>::with_capacity(&ctx, 4).unwrap();
        buf.free().unwrap();
        assert_eq!(buf.state(), BufferState::Freed);
        assert_eq!(
            buf.free(),
            Err(MemoryError::AlreadyFreed { ptr: buf.ptr() })
        );
        assert_eq!(ctx.mem_snapshot().current, 0);
    }

    #[test]
    #[should_panic(expected = "Zero-length")]
    fn test_zero_length_allocation_panics() {
        let ctx = cpu_context(1 << 16);
        let _ = DeviceBuffer::<u32>::with_capacity(&ctx, 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "use of freed device buffer")]
    fn test_view_after_free_panics() {
        let ctx = cpu_context(1 << 16);
        let stream = ctx.create_stream().unwrap();
        let mut buf = DeviceBuffer::<u32>::with_capacity(&ctx, 4).unwrap();
        buf.free().unwrap();
        let _ = buf.view(&stream);
    }

    #[test]
    fn test_pending_write_blocks_other_streams() {
        let ctx = cpu_context(1 << 16);
        let first = ctx.create_stream().unwrap();
        let second = ctx.create_stream().unwrap();
        let mut buf = DeviceBuffer::<u32>::with_capacity(&ctx, 8).unwrap();

        let (release, gate) = mpsc::channel::<()>();
        let view = buf.view_mut(&first).unwrap();
        first
            .enqueue("fill", move |kernel| {
                gate.recv().ok();
                view.write(kernel).fill(9);
                Ok(())
            })
            .unwrap();

        assert_eq!(
            buf.state(),
            BufferState::Pending {
                stream: first.id(),
                outstanding: 1
            }
        );
        assert!(matches!(
            buf.view(&second),
            Err(MemoryError::AsyncNotReady { stream, .. }) if stream == first.id()
        ));
        assert!(matches!(
            buf.host_read(),
            Err(MemoryError::AsyncNotReady { .. })
        ));
        // Same-stream reads are ordered after the write.
        let same = buf.view(&first).unwrap();
        let observed = first
            .enqueue_with_result("read", move |kernel| Ok(same.read(kernel).to_vec()))
            .unwrap();

        release.send(()).unwrap();
        assert_eq!(observed.wait().unwrap(), vec![9; 8]);
        assert_eq!(buf.state(), BufferState::Ready);
        assert_eq!(&*buf.host_read().unwrap(), &[9; 8]);
    }

    #[test]
    fn test_failed_write_keeps_buffer_pending() {
        let ctx = cpu_context(1 << 16);
        let stream = ctx.create_stream().unwrap();
        let mut buf = DeviceBuffer::<u32>::with_capacity(&ctx, 4).unwrap();

        let view = buf.view_mut(&stream).unwrap();
        let ticket = stream
            .enqueue("fill", move |kernel| {
                let _ = view.len();
                Err(kernel.fail("fill", "device lost"))
            })
            .unwrap();
        while !stream.is_completed(ticket) {
            std::thread::yield_now();
        }

        assert!(matches!(
            buf.state(),
            BufferState::Pending { stream: id, .. } if id == stream.id()
        ));
        assert!(matches!(
            buf.host_read(),
            Err(MemoryError::AsyncNotReady { .. })
        ));
        assert!(matches!(
            stream.synchronize(),
            Err(StreamError::Device(DeviceError::KernelFailed { kernel: "fill", .. }))
        ));
        assert_eq!(buf.state(), BufferState::Ready);
        assert_eq!(&*buf.host_read().unwrap(), &[0; 4]);
    }

    #[test]
    fn test_unused_view_releases_on_drop() {
        let ctx = cpu_context(1 << 16);
        let stream = ctx.create_stream().unwrap();
        let mut buf = DeviceBuffer::<u32>::with_capacity(&ctx, 4).unwrap();
        drop(buf.view_mut(&stream).unwrap());
        assert_eq!(buf.state(), BufferState::Ready);
    }

    #[test]
    fn test_async_allocation() {
        let ctx = cpu_context(1 << 16);
        let stream = ctx.create_stream().unwrap();
        let pending = DeviceBuffer::<u64>::with_capacity_async(&ctx, 16, &stream).unwrap();
        let buf = pending.wait().unwrap();
        assert_eq!(buf.state(), BufferState::Ready);
        assert_eq!(buf.len(), 16);
    }
}
