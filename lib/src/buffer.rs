//! Client-visible buffer objects.
use std::any::Any;
use std::fmt;
use std::os::unix::io::OwnedFd;
use std::ptr::NonNull;

use log::{error, trace, warn};

use crate::backend::BufferBackend;
use crate::device::Device;
use crate::ioctl::PrimeFlags;
use crate::kernel::Kernel;
use crate::{Error, Result};

/// Data a client can attach to a buffer.
pub type UserData = Box<dyn Any + Send>;

/// Called with the buffer's user data right before the buffer is destroyed.
pub type DestroyCallback = Box<dyn FnOnce(Option<UserData>) + Send>;

/// Current CPU mapping of a buffer, along with the intents it was requested with.
#[derive(Debug, Clone, Copy)]
struct CpuAccess {
    data: NonNull<u8>,
    read: bool,
    write: bool,
}

// Safe because the mapping is only dereferenced through the `Buffer` owning it, which requires
// `&mut self` to do so.
unsafe impl Send for CpuAccess {}

/// A GEM object of a [`Device`], as seen by one client.
///
/// Several buffers may wrap the same GEM handle if the same object has been imported more than
/// once. The handle is closed when the last of them is destroyed, either explicitly through
/// [`Buffer::destroy`] or by dropping it.
pub struct Buffer<'a, K: Kernel> {
    device: &'a Device<K>,
    backend: &'a dyn BufferBackend<K>,
    handle: u32,
    size: u32,
    name: Option<u32>,
    access: Option<CpuAccess>,
    user_data: Option<UserData>,
    destroy_callback: Option<DestroyCallback>,
    /// Cleared once the buffer has been torn down, or must not be.
    live: bool,
}

impl<'a, K: Kernel> Buffer<'a, K> {
    /// Wraps `handle`, whose reference must already have been taken in the device's table.
    pub(crate) fn new(
        device: &'a Device<K>,
        backend: &'a dyn BufferBackend<K>,
        handle: u32,
        size: u32,
    ) -> Self {
        Buffer {
            device,
            backend,
            handle,
            size,
            name: None,
            access: None,
            user_data: None,
            destroy_callback: None,
            live: true,
        }
    }

    /// GEM handle of this buffer, valid on the device's file descriptor.
    pub fn handle(&self) -> u32 {
        self.handle
    }

    /// Size of this buffer in bytes.
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn device(&self) -> &'a Device<K> {
        self.device
    }

    /// Maps the buffer for CPU access and returns the address of its first byte.
    ///
    /// `read` and `write` tell the backend what the CPU intends to do with the memory; they are
    /// passed back to it when access ends. Fails with [`Error::Busy`] if the buffer is already
    /// mapped.
    pub fn begin_cpu_access(&mut self, read: bool, write: bool) -> Result<NonNull<u8>> {
        trace!(
            "begin_cpu_access handle {} read {} write {}",
            self.handle,
            read,
            write
        );

        if self.access.is_some() {
            return Err(Error::Busy);
        }

        let data = self
            .backend
            .cpu_access_prepare(self.device.kernel(), self.handle, self.size)?;
        self.access = Some(CpuAccess { data, read, write });

        Ok(data)
    }

    /// Ends CPU access. Does nothing if the buffer is not mapped.
    pub fn end_cpu_access(&mut self) {
        trace!("end_cpu_access handle {}", self.handle);

        if let Some(access) = self.access.take() {
            self.backend.cpu_access_finish(
                self.device.kernel(),
                access.data,
                self.size,
                access.read,
                access.write,
            );
        }
    }

    pub fn is_mapped(&self) -> bool {
        self.access.is_some()
    }

    /// Returns the mapped content of the buffer, if it is mapped.
    pub fn mapping_mut(&mut self) -> Option<&mut [u8]> {
        let access = self.access.as_ref()?;

        // Safe because the mapping covers `size` bytes and stays valid until `end_cpu_access`,
        // which cannot be called while the returned slice borrows `self`.
        Some(unsafe { std::slice::from_raw_parts_mut(access.data.as_ptr(), self.size as usize) })
    }

    /// Returns the global name of this buffer, creating it on first use.
    pub fn export_name(&mut self) -> Result<u32> {
        if let Some(name) = self.name {
            return Ok(name);
        }

        let name = self.device.kernel().flink(self.handle)?;
        trace!("handle {} exported as name {:#x}", self.handle, name);
        self.name = Some(name);

        Ok(name)
    }

    /// Exports this buffer as a new DMABUF descriptor, closed on exec.
    pub fn export_fd(&self) -> Result<OwnedFd> {
        Ok(self
            .device
            .kernel()
            .handle_to_fd(self.handle, PrimeFlags::CLOEXEC)?)
    }

    pub fn user_data(&self) -> Option<&(dyn Any + Send)> {
        self.user_data.as_deref()
    }

    /// Attaches `data` to the buffer, replacing any previous data and callback. The previous
    /// callback is not invoked.
    ///
    /// `callback` will receive `data` when the buffer is destroyed.
    pub fn set_user_data(
        &mut self,
        data: Option<UserData>,
        callback: Option<DestroyCallback>,
    ) {
        self.user_data = data;
        self.destroy_callback = callback;
    }

    /// Destroys the buffer, closing its GEM handle if no other buffer uses it.
    ///
    /// The handle is forgotten even if closing it fails.
    ///
    /// # Panics
    ///
    /// If the buffer is still mapped. The handle is then left untouched.
    pub fn destroy(mut self) -> Result<()> {
        trace!("destroy handle {}", self.handle);

        if self.access.is_some() {
            self.live = false;
            panic!("destroying buffer {} while it is mapped", self.handle);
        }

        self.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        self.live = false;

        if let Some(callback) = self.destroy_callback.take() {
            callback(self.user_data.take());
        }

        let mut handles = self.device.lock_handles();
        self.backend
            .destroy(self.device.kernel(), &mut handles, self.handle)
    }
}

impl<'a, K: Kernel> Drop for Buffer<'a, K> {
    fn drop(&mut self) {
        if !self.live {
            return;
        }

        if self.access.is_some() {
            warn!("buffer {} dropped while mapped", self.handle);
            self.end_cpu_access();
        }

        if let Err(e) = self.teardown() {
            error!("failed to destroy buffer {}: {}", self.handle, e);
        }
    }
}

impl<'a, K: Kernel> fmt::Debug for Buffer<'a, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("name", &self.name)
            .field("mapped", &self.is_mapped())
            .finish()
    }
}
