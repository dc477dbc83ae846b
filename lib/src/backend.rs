//! Allocation strategies.
//!
//! A [`crate::Device`] delegates every decision about how its buffers are laid out, allocated
//! and mapped to a [`DeviceBackend`], and every buffer it creates uses the backend's
//! [`BufferBackend`] for CPU access and teardown. Locking and reference counting stay in the
//! device, so a backend only has to talk to the kernel.
//!
//! [`DumbBackend`] is the default strategy: linear "dumb" buffers, mapped through
//! `DRM_IOCTL_MODE_MAP_DUMB`.
use std::ptr::NonNull;

use log::trace;

use crate::handles::HandleTable;
use crate::kernel::Kernel;
use crate::{Error, Result, UsageFlags};

/// Device-level operations of an allocation strategy.
pub trait DeviceBackend<K: Kernel>: Send + Sync {
    /// Computes the stride and total size in bytes of a `width`x`height` image of `bpp` bits
    /// per pixel.
    fn stride_and_size(
        &self,
        width: u32,
        height: u32,
        bpp: u32,
        usage: UsageFlags,
    ) -> Result<(u32, u32)>;

    /// Allocates `size` bytes of memory for `usage` and returns the handle of the new object.
    ///
    /// Called with the device lock held. The returned handle has not been registered yet.
    fn create_buffer(&self, kernel: &K, size: u32, usage: UsageFlags) -> Result<u32>;

    /// Called before a buffer is built around `handle`, once its reference has been taken.
    ///
    /// Returning an error aborts the creation or import: the reference is dropped again, which
    /// closes the handle if nothing else uses it.
    fn bind_buffer(&self, _handle: u32, _size: u32) -> Result<()> {
        Ok(())
    }

    /// Returns the operations used by the buffers of this backend.
    fn buffer_backend(&self) -> &dyn BufferBackend<K>;
}

/// Buffer-level operations of an allocation strategy.
pub trait BufferBackend<K: Kernel>: Send + Sync {
    /// Makes the `size` bytes of `handle` accessible to the CPU and returns their address.
    fn cpu_access_prepare(&self, kernel: &K, handle: u32, size: u32) -> Result<NonNull<u8>>;

    /// Ends CPU access started by `cpu_access_prepare`. `read` and `write` are the intents
    /// given when access started.
    ///
    /// # Panics
    ///
    /// If the mapping cannot be torn down.
    fn cpu_access_finish(
        &self,
        kernel: &K,
        data: NonNull<u8>,
        size: u32,
        read: bool,
        write: bool,
    );

    /// Releases the buffer's reference to `handle`. Called with the device lock held.
    fn destroy(&self, kernel: &K, handles: &mut HandleTable, handle: u32) -> Result<()> {
        handles.release(kernel, handle).map(drop)
    }
}

fn align(v: u32, a: u32) -> Option<u32> {
    Some(v.checked_add(a - 1)? & !(a - 1))
}

/// Linear buffers allocated with `DRM_IOCTL_MODE_CREATE_DUMB`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DumbBackend;

impl DumbBackend {
    pub fn new() -> Self {
        Self
    }
}

impl<K: Kernel> DeviceBackend<K> for DumbBackend {
    /// Lines are padded to a multiple of 8 pixels, and pixels to a whole number of bytes.
    fn stride_and_size(
        &self,
        width: u32,
        height: u32,
        bpp: u32,
        _usage: UsageFlags,
    ) -> Result<(u32, u32)> {
        let overflow = || Error::InvalidArgument("image dimensions overflow");

        let stride = (align(bpp, 8).ok_or_else(overflow)? / 8)
            .checked_mul(align(width, 8).ok_or_else(overflow)?)
            .ok_or_else(overflow)?;
        let size = stride.checked_mul(height).ok_or_else(overflow)?;

        Ok((stride, size))
    }

    fn create_buffer(&self, kernel: &K, size: u32, usage: UsageFlags) -> Result<u32> {
        trace!("creating dumb buffer of {} bytes for {:?}", size, usage);

        // A single column of `size` 8-bit pixels gives exactly `size` bytes.
        Ok(kernel.create_dumb(1, size, 8)?)
    }

    fn buffer_backend(&self) -> &dyn BufferBackend<K> {
        self
    }
}

impl<K: Kernel> BufferBackend<K> for DumbBackend {
    fn cpu_access_prepare(&self, kernel: &K, handle: u32, size: u32) -> Result<NonNull<u8>> {
        Ok(kernel.map(handle, size as usize)?)
    }

    fn cpu_access_finish(
        &self,
        kernel: &K,
        data: NonNull<u8>,
        size: u32,
        _read: bool,
        _write: bool,
    ) {
        // Safe because `data` was returned by `cpu_access_prepare` for the same size, and the
        // buffer forgets it once we return.
        if let Err(e) = unsafe { kernel.unmap(data, size as usize) } {
            panic!("failed to unmap buffer at {:p}: {}", data, e);
        }
    }
}
