//! Safe wrappers for the `DRM_IOCTL_GEM_(CLOSE|FLINK|OPEN)` ioctls.
use nix::errno::Errno;
use std::os::unix::io::AsRawFd;
use thiserror::Error;

use super::drm_ioctl;
use crate::bindings;

#[doc(hidden)]
mod ioctl {
    use crate::bindings::{drm_gem_close, drm_gem_flink, drm_gem_open};
    nix::ioctl_write_ptr!(drm_ioctl_gem_close, b'd', 0x09, drm_gem_close);
    nix::ioctl_readwrite!(drm_ioctl_gem_flink, b'd', 0x0a, drm_gem_flink);
    nix::ioctl_readwrite!(drm_ioctl_gem_open, b'd', 0x0b, drm_gem_open);
}

#[derive(Debug, Error)]
pub enum GemCloseError {
    #[error("invalid GEM handle {0}")]
    InvalidHandle(u32),
    #[error("ioctl error: {0}")]
    IoctlError(Errno),
}

impl From<GemCloseError> for Errno {
    fn from(err: GemCloseError) -> Self {
        match err {
            GemCloseError::InvalidHandle(_) => Errno::EINVAL,
            GemCloseError::IoctlError(e) => e,
        }
    }
}

/// Safe wrapper around the `DRM_IOCTL_GEM_CLOSE` ioctl.
pub fn gem_close(fd: &impl AsRawFd, handle: u32) -> Result<(), GemCloseError> {
    let close_req = bindings::drm_gem_close {
        handle,
        ..Default::default()
    };

    match drm_ioctl(|| unsafe { ioctl::drm_ioctl_gem_close(fd.as_raw_fd(), &close_req) }) {
        Ok(_) => Ok(()),
        Err(Errno::EINVAL) => Err(GemCloseError::InvalidHandle(handle)),
        Err(e) => Err(GemCloseError::IoctlError(e)),
    }
}

#[derive(Debug, Error)]
pub enum GemFlinkError {
    #[error("GEM handle {0} does not exist")]
    UnknownHandle(u32),
    #[error("driver does not support global names")]
    NotSupported,
    #[error("ioctl error: {0}")]
    IoctlError(Errno),
}

impl From<GemFlinkError> for Errno {
    fn from(err: GemFlinkError) -> Self {
        match err {
            GemFlinkError::UnknownHandle(_) => Errno::ENOENT,
            GemFlinkError::NotSupported => Errno::ENODEV,
            GemFlinkError::IoctlError(e) => e,
        }
    }
}

/// Safe wrapper around the `DRM_IOCTL_GEM_FLINK` ioctl. Returns the global name of `handle`.
pub fn gem_flink(fd: &impl AsRawFd, handle: u32) -> Result<u32, GemFlinkError> {
    let mut flink_req = bindings::drm_gem_flink {
        handle,
        ..Default::default()
    };

    match drm_ioctl(|| unsafe { ioctl::drm_ioctl_gem_flink(fd.as_raw_fd(), &mut flink_req) }) {
        Ok(_) => Ok(flink_req.name),
        Err(Errno::ENOENT) => Err(GemFlinkError::UnknownHandle(handle)),
        Err(Errno::ENODEV) => Err(GemFlinkError::NotSupported),
        Err(e) => Err(GemFlinkError::IoctlError(e)),
    }
}

/// Result of a successful `DRM_IOCTL_GEM_OPEN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GemOpen {
    /// Handle local to our file description.
    pub handle: u32,
    /// Size of the object as reported by the kernel.
    pub size: u64,
}

#[derive(Debug, Error)]
pub enum GemOpenError {
    #[error("no object with global name {0}")]
    UnknownName(u32),
    #[error("ioctl error: {0}")]
    IoctlError(Errno),
}

impl From<GemOpenError> for Errno {
    fn from(err: GemOpenError) -> Self {
        match err {
            GemOpenError::UnknownName(_) => Errno::ENOENT,
            GemOpenError::IoctlError(e) => e,
        }
    }
}

/// Safe wrapper around the `DRM_IOCTL_GEM_OPEN` ioctl.
pub fn gem_open(fd: &impl AsRawFd, name: u32) -> Result<GemOpen, GemOpenError> {
    let mut open_req = bindings::drm_gem_open {
        name,
        ..Default::default()
    };

    match drm_ioctl(|| unsafe { ioctl::drm_ioctl_gem_open(fd.as_raw_fd(), &mut open_req) }) {
        Ok(_) => Ok(GemOpen {
            handle: open_req.handle,
            size: open_req.size,
        }),
        Err(Errno::ENOENT) => Err(GemOpenError::UnknownName(name)),
        Err(e) => Err(GemOpenError::IoctlError(e)),
    }
}
