//! Safe wrapper for the `DRM_IOCTL_VERSION` ioctl.
use nix::errno::Errno;
use std::os::raw::c_char;
use std::os::unix::io::AsRawFd;
use thiserror::Error;

use super::drm_ioctl;
use crate::bindings;

#[doc(hidden)]
mod ioctl {
    use crate::bindings::drm_version;
    nix::ioctl_readwrite!(drm_ioctl_version, b'd', 0x00, drm_version);
}

/// Safe variant of the `drm_version` struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub major: i32,
    pub minor: i32,
    pub patchlevel: i32,
    /// Name of the driver, e.g. `omapdrm`.
    pub name: String,
    pub date: String,
    pub desc: String,
}

#[derive(Debug, Error)]
pub enum VersionError {
    #[error("ioctl error: {0}")]
    IoctlError(#[from] Errno),
}

impl From<VersionError> for Errno {
    fn from(err: VersionError) -> Self {
        match err {
            VersionError::IoctlError(e) => e,
        }
    }
}

fn lossy_string(buf: &[u8], len: usize) -> String {
    String::from_utf8_lossy(&buf[..len.min(buf.len())]).into_owned()
}

/// Safe wrapper around the `DRM_IOCTL_VERSION` ioctl.
///
/// The ioctl is called twice: once to learn the length of the strings, then again with buffers
/// large enough to receive them.
pub fn version(fd: &impl AsRawFd) -> Result<Version, VersionError> {
    let mut drm_version = bindings::drm_version::default();
    drm_ioctl(|| unsafe { ioctl::drm_ioctl_version(fd.as_raw_fd(), &mut drm_version) })?;

    let mut name = vec![0u8; drm_version.name_len];
    let mut date = vec![0u8; drm_version.date_len];
    let mut desc = vec![0u8; drm_version.desc_len];

    let mut drm_version = bindings::drm_version {
        name_len: name.len(),
        name: name.as_mut_ptr() as *mut c_char,
        date_len: date.len(),
        date: date.as_mut_ptr() as *mut c_char,
        desc_len: desc.len(),
        desc: desc.as_mut_ptr() as *mut c_char,
        ..Default::default()
    };
    // Safe because the string pointers are valid for the lengths we pass.
    drm_ioctl(|| unsafe { ioctl::drm_ioctl_version(fd.as_raw_fd(), &mut drm_version) })?;

    Ok(Version {
        major: drm_version.version_major,
        minor: drm_version.version_minor,
        patchlevel: drm_version.version_patchlevel,
        name: lossy_string(&name, drm_version.name_len),
        date: lossy_string(&date, drm_version.date_len),
        desc: lossy_string(&desc, drm_version.desc_len),
    })
}
