//! Safe wrappers for the `DRM_IOCTL_PRIME_(HANDLE_TO_FD|FD_TO_HANDLE)` ioctls.
use bitflags::bitflags;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use std::os::unix::io::{AsRawFd, FromRawFd};
use thiserror::Error;

use super::drm_ioctl;
use crate::bindings;

bitflags! {
    /// Flags that can be passed when exporting a handle as a DMABUF file descriptor.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PrimeFlags: u32 {
        const CLOEXEC = OFlag::O_CLOEXEC.bits() as u32;
        const RDWR = OFlag::O_RDWR.bits() as u32;
    }
}

#[doc(hidden)]
mod ioctl {
    use crate::bindings::drm_prime_handle;
    nix::ioctl_readwrite!(drm_ioctl_prime_handle_to_fd, b'd', 0x2d, drm_prime_handle);
    nix::ioctl_readwrite!(drm_ioctl_prime_fd_to_handle, b'd', 0x2e, drm_prime_handle);
}

#[derive(Debug, Error)]
pub enum PrimeHandleToFdError {
    #[error("GEM handle {0} does not exist")]
    UnknownHandle(u32),
    #[error("ioctl error: {0}")]
    IoctlError(Errno),
}

impl From<PrimeHandleToFdError> for Errno {
    fn from(err: PrimeHandleToFdError) -> Self {
        match err {
            PrimeHandleToFdError::UnknownHandle(_) => Errno::ENOENT,
            PrimeHandleToFdError::IoctlError(e) => e,
        }
    }
}

/// Safe wrapper around the `DRM_IOCTL_PRIME_HANDLE_TO_FD` ioctl.
///
/// The returned descriptor is owned by `R`.
pub fn prime_handle_to_fd<F: AsRawFd, R: FromRawFd>(
    fd: &F,
    handle: u32,
    flags: PrimeFlags,
) -> Result<R, PrimeHandleToFdError> {
    let mut prime_req = bindings::drm_prime_handle {
        handle,
        flags: flags.bits() & (bindings::DRM_CLOEXEC | bindings::DRM_RDWR),
        fd: -1,
    };

    match drm_ioctl(|| unsafe {
        ioctl::drm_ioctl_prime_handle_to_fd(fd.as_raw_fd(), &mut prime_req)
    }) {
        // Safe because the kernel just gave us ownership of this descriptor.
        Ok(_) => Ok(unsafe { R::from_raw_fd(prime_req.fd) }),
        Err(Errno::ENOENT) => Err(PrimeHandleToFdError::UnknownHandle(handle)),
        Err(e) => Err(PrimeHandleToFdError::IoctlError(e)),
    }
}

#[derive(Debug, Error)]
pub enum PrimeFdToHandleError {
    #[error("descriptor is not a DMABUF this device can import")]
    InvalidDescriptor,
    #[error("ioctl error: {0}")]
    IoctlError(Errno),
}

impl From<PrimeFdToHandleError> for Errno {
    fn from(err: PrimeFdToHandleError) -> Self {
        match err {
            PrimeFdToHandleError::InvalidDescriptor => Errno::EBADF,
            PrimeFdToHandleError::IoctlError(e) => e,
        }
    }
}

/// Safe wrapper around the `DRM_IOCTL_PRIME_FD_TO_HANDLE` ioctl.
///
/// Importing a DMABUF that is already known to this file description returns the existing
/// handle, which is why handles must be reference-counted by the caller.
pub fn prime_fd_to_handle(
    fd: &impl AsRawFd,
    dmabuf: &impl AsRawFd,
) -> Result<u32, PrimeFdToHandleError> {
    let mut prime_req = bindings::drm_prime_handle {
        fd: dmabuf.as_raw_fd(),
        ..Default::default()
    };

    match drm_ioctl(|| unsafe {
        ioctl::drm_ioctl_prime_fd_to_handle(fd.as_raw_fd(), &mut prime_req)
    }) {
        Ok(_) => Ok(prime_req.handle),
        Err(Errno::EBADF) => Err(PrimeFdToHandleError::InvalidDescriptor),
        Err(e) => Err(PrimeFdToHandleError::IoctlError(e)),
    }
}
