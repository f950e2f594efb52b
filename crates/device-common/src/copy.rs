//! Host/device transfers.
//!
//! Every transfer requires the host and device lengths to agree exactly. Asynchronous variants
//! snapshot the host data at enqueue time, so the caller may reuse its slice immediately; the
//! device side is only valid once the returned [Pending] handle is waited on.

use crate::{
    common::DeviceContext,
    d_buffer::{DeviceBuffer, DeviceRepr},
    error::MemCopyError,
    stream::{Pending, Stream},
};

pub trait MemCopyH2D<T: DeviceRepr> {
    /// Copies into an existing device buffer of the same length.
    fn copy_to(&self, dst: &mut DeviceBuffer<T>) -> Result<(), MemCopyError>;

    fn copy_to_async<'s>(
        &self,
        dst: &mut DeviceBuffer<T>,
        stream: &'s Stream,
    ) -> Result<Pending<'s, ()>, MemCopyError>;

    /// Allocates a new device buffer holding a copy of `self`.
    fn to_device(&self, ctx: &DeviceContext) -> Result<DeviceBuffer<T>, MemCopyError>;

    fn to_device_async<'s>(
        &self,
        ctx: &DeviceContext,
        stream: &'s Stream,
    ) -> Result<Pending<'s, DeviceBuffer<T>>, MemCopyError>;
}

impl<T: DeviceRepr> MemCopyH2D<T> for [T] {
    fn copy_to(&self, dst: &mut DeviceBuffer<T>) -> Result<(), MemCopyError> {
        check_len("copy_to", self.len(), dst.len())?;
        dst.host_write()?.clone_from_slice(self);
        Ok(())
    }

    fn copy_to_async<'s>(
        &self,
        dst: &mut DeviceBuffer<T>,
        stream: &'s Stream,
    ) -> Result<Pending<'s, ()>, MemCopyError> {
        check_len("copy_to_async", self.len(), dst.len())?;
        dst.context().check_stream(stream)?;
        let staged = self.to_vec();
        let view = dst.view_mut(stream)?;
        let ticket = stream.enqueue("memcpy_h2d", move |kernel| {
            view.write(kernel).clone_from_slice(&staged);
            Ok(())
        })?;
        Ok(stream.pending(ticket, ()))
    }

    fn to_device(&self, ctx: &DeviceContext) -> Result<DeviceBuffer<T>, MemCopyError> {
        let mut dst = DeviceBuffer::with_capacity(ctx, self.len())?;
        self.copy_to(&mut dst)?;
        Ok(dst)
    }

    fn to_device_async<'s>(
        &self,
        ctx: &DeviceContext,
        stream: &'s Stream,
    ) -> Result<Pending<'s, DeviceBuffer<T>>, MemCopyError> {
        ctx.check_stream(stream)?;
        let mut dst = DeviceBuffer::with_capacity(ctx, self.len())?;
        let ticket = self.copy_to_async(&mut dst, stream)?.ticket();
        Ok(stream.pending(ticket, dst))
    }
}

pub trait MemCopyD2H<T> {
    fn to_host(&self) -> Result<Vec<T>, MemCopyError>;

    fn copy_to_host(&self, dst: &mut [T]) -> Result<(), MemCopyError>;

    fn to_host_async<'s>(&self, stream: &'s Stream) -> Result<Pending<'s, Vec<T>>, MemCopyError>;
}

impl<T: DeviceRepr> MemCopyD2H<T> for DeviceBuffer<T> {
    fn to_host(&self) -> Result<Vec<T>, MemCopyError> {
        Ok(self.host_read()?.to_vec())
    }

    fn copy_to_host(&self, dst: &mut [T]) -> Result<(), MemCopyError> {
        check_len("copy_to_host", dst.len(), self.len())?;
        dst.clone_from_slice(&self.host_read()?);
        Ok(())
    }

    fn to_host_async<'s>(&self, stream: &'s Stream) -> Result<Pending<'s, Vec<T>>, MemCopyError> {
        self.context().check_stream(stream)?;
        let view = self.view(stream)?;
        Ok(stream.enqueue_with_result("memcpy_d2h", move |kernel| {
            Ok(view.read(kernel).to_vec())
        })?)
    }
}

pub trait MemCopyD2D<T: DeviceRepr> {
    /// Copies device contents into `dst`, ordered on `stream`.
    fn copy_to_buffer<'s>(
        &self,
        dst: &mut DeviceBuffer<T>,
        stream: &'s Stream,
    ) -> Result<Pending<'s, ()>, MemCopyError>;
}

impl<T: DeviceRepr> MemCopyD2D<T> for DeviceBuffer<T> {
    fn copy_to_buffer<'s>(
        &self,
        dst: &mut DeviceBuffer<T>,
        stream: &'s Stream,
    ) -> Result<Pending<'s, ()>, MemCopyError> {
        check_len("copy_to_buffer", self.len(), dst.len())?;
        let src = self.view(stream)?;
        let dst = dst.view_mut(stream)?;
        let ticket = stream.enqueue("memcpy_d2d", move |kernel| {
            dst.write(kernel).clone_from_slice(&src.read(kernel));
            Ok(())
        })?;
        Ok(stream.pending(ticket, ()))
    }
}

/// Copies `host` into `device`. With a stream the copy is ordered on it and completes at the
/// next synchronization; without one it completes before returning.
pub fn copy_to_device<T: DeviceRepr>(
    host: &[T],
    device: &mut DeviceBuffer<T>,
    stream: Option<&Stream>,
) -> Result<(), MemCopyError> {
    match stream {
        Some(stream) => {
            // Completion is observed through the stream.
            let _ticket = host.copy_to_async(device, stream)?.ticket();
            Ok(())
        }
        None => host.copy_to(device),
    }
}

/// Copies `device` into `host`, blocking until the data is on the host.
pub fn copy_from_device<T: DeviceRepr>(
    device: &DeviceBuffer<T>,
    host: &mut [T],
    stream: Option<&Stream>,
) -> Result<(), MemCopyError> {
    match stream {
        Some(stream) => {
            check_len("copy_from_device", host.len(), device.len())?;
            let data = device.to_host_async(stream)?.wait()?;
            host.clone_from_slice(&data);
            Ok(())
        }
        None => device.copy_to_host(host),
    }
}

fn check_len(
    operation: &'static str,
    host_len: usize,
    device_len: usize,
) -> Result<(), MemCopyError> {
    if host_len != device_len {
        return Err(MemCopyError::SizeMismatch {
            operation,
            host_len,
            device_len,
        });
    }
    Ok(())
}
