//! Safe wrappers for the `DRM_IOCTL_MODE_(CREATE|MAP)_DUMB` ioctls.
use nix::errno::Errno;
use std::os::unix::io::AsRawFd;
use thiserror::Error;

use super::drm_ioctl;
use crate::bindings;

#[doc(hidden)]
mod ioctl {
    use crate::bindings::{drm_mode_create_dumb, drm_mode_map_dumb};
    nix::ioctl_readwrite!(drm_ioctl_mode_create_dumb, b'd', 0xb2, drm_mode_create_dumb);
    nix::ioctl_readwrite!(drm_ioctl_mode_map_dumb, b'd', 0xb3, drm_mode_map_dumb);
}

/// Result of a successful `DRM_IOCTL_MODE_CREATE_DUMB`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumbBuffer {
    pub handle: u32,
    pub pitch: u32,
    pub size: u64,
}

#[derive(Debug, Error)]
pub enum CreateDumbError {
    #[error("invalid dumb buffer geometry {width}x{height}x{bpp}")]
    InvalidGeometry { width: u32, height: u32, bpp: u32 },
    #[error("driver does not support dumb buffers")]
    NotSupported,
    #[error("out of memory")]
    NoMemory,
    #[error("ioctl error: {0}")]
    IoctlError(Errno),
}

impl From<CreateDumbError> for Errno {
    fn from(err: CreateDumbError) -> Self {
        match err {
            CreateDumbError::InvalidGeometry { .. } => Errno::EINVAL,
            CreateDumbError::NotSupported => Errno::ENOSYS,
            CreateDumbError::NoMemory => Errno::ENOMEM,
            CreateDumbError::IoctlError(e) => e,
        }
    }
}

/// Safe wrapper around the `DRM_IOCTL_MODE_CREATE_DUMB` ioctl.
pub fn create_dumb(
    fd: &impl AsRawFd,
    width: u32,
    height: u32,
    bpp: u32,
) -> Result<DumbBuffer, CreateDumbError> {
    let mut create_req = bindings::drm_mode_create_dumb {
        width,
        height,
        bpp,
        ..Default::default()
    };

    match drm_ioctl(|| unsafe {
        ioctl::drm_ioctl_mode_create_dumb(fd.as_raw_fd(), &mut create_req)
    }) {
        Ok(_) => Ok(DumbBuffer {
            handle: create_req.handle,
            pitch: create_req.pitch,
            size: create_req.size,
        }),
        Err(Errno::EINVAL) => Err(CreateDumbError::InvalidGeometry { width, height, bpp }),
        Err(Errno::ENOSYS) | Err(Errno::EOPNOTSUPP) => Err(CreateDumbError::NotSupported),
        Err(Errno::ENOMEM) => Err(CreateDumbError::NoMemory),
        Err(e) => Err(CreateDumbError::IoctlError(e)),
    }
}

#[derive(Debug, Error)]
pub enum MapDumbError {
    #[error("GEM handle {0} does not exist")]
    UnknownHandle(u32),
    #[error("ioctl error: {0}")]
    IoctlError(Errno),
}

impl From<MapDumbError> for Errno {
    fn from(err: MapDumbError) -> Self {
        match err {
            MapDumbError::UnknownHandle(_) => Errno::ENOENT,
            MapDumbError::IoctlError(e) => e,
        }
    }
}

/// Safe wrapper around the `DRM_IOCTL_MODE_MAP_DUMB` ioctl.
///
/// Returns the fake offset to pass to `mmap` on the DRM file descriptor in order to map the
/// buffer.
pub fn map_dumb(fd: &impl AsRawFd, handle: u32) -> Result<u64, MapDumbError> {
    let mut map_req = bindings::drm_mode_map_dumb {
        handle,
        ..Default::default()
    };

    match drm_ioctl(|| unsafe { ioctl::drm_ioctl_mode_map_dumb(fd.as_raw_fd(), &mut map_req) }) {
        Ok(_) => Ok(map_req.offset),
        Err(Errno::ENOENT) => Err(MapDumbError::UnknownHandle(handle)),
        Err(e) => Err(MapDumbError::IoctlError(e)),
    }
}
