//! This library manages memory buffers shared with a DRM display device, providing two levels
//! of abstraction:
//!
//! * The `ioctl` module provides direct, thin wrappers over the DRM ioctls needed to create,
//!   name, import, export, map and close GEM objects. "Safety" here is in terms of memory
//!   safety: this layer won't guard against passing handles that the kernel will reject, it just
//!   makes sure that data passed from and to the kernel can be accessed safely.
//!
//! * The `device` and `buffer` modules provide the buffer manager itself. A [`device::Device`]
//!   keeps track of how many [`buffer::Buffer`]s reference each GEM handle, so a handle that has
//!   been imported several times (by global name or by DMABUF descriptor) is closed exactly once,
//!   when its last buffer goes away. How buffers are actually allocated and mapped is decided by
//!   a pluggable [`backend::DeviceBackend`], the default one creating linear "dumb" buffers.
//!
//! The kernel is reached through the [`kernel::Kernel`] trait, implemented over a real DRM file
//! descriptor by [`kernel::DrmKernel`].
pub mod backend;
#[doc(hidden)]
pub mod bindings;
pub mod buffer;
pub mod device;
pub mod format;
pub mod handles;
pub mod ioctl;
pub mod kernel;

use std::fmt;

use nix::errno::Errno;
use thiserror::Error;

pub use buffer::Buffer;
pub use device::{Device, DeviceConfig};
pub use format::{bpp_from_pixel_format, BoFormat, FormatInfo, UsageFlags};

/// Error type for anything that can go wrong while managing buffers.
///
/// Contract violations (releasing a handle that is not tracked, destroying a buffer that is
/// still mapped) are not represented here: they panic.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("no such device")]
    NoSuchDevice,
    #[error("buffer is already mapped for CPU access")]
    Busy,
    #[error("out of memory")]
    ResourceExhausted,
    #[error("kernel operation failed: {0}")]
    KernelOperationFailed(Errno),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        match errno {
            Errno::ENOMEM => Error::ResourceExhausted,
            e => Error::KernelOperationFailed(e),
        }
    }
}

/// Converts an error back into the error code a C caller expects in `errno`.
impl From<Error> for Errno {
    fn from(err: Error) -> Self {
        match err {
            Error::InvalidArgument(_) => Errno::EINVAL,
            Error::NoSuchDevice => Errno::ENODEV,
            Error::Busy => Errno::EBUSY,
            Error::ResourceExhausted => Errno::ENOMEM,
            Error::KernelOperationFailed(e) => e,
        }
    }
}

/// A Fourcc pixel format, as used by DRM and GBM. It can be converted back and forth from a
/// 32-bit integer, or a 4-bytes string.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PixelFormat(u32);

impl PixelFormat {
    pub const fn from_u32(v: u32) -> Self {
        Self(v)
    }

    pub const fn to_u32(self) -> u32 {
        self.0
    }

    pub const fn from_fourcc(n: &[u8; 4]) -> Self {
        Self(n[0] as u32 | (n[1] as u32) << 8 | (n[2] as u32) << 16 | (n[3] as u32) << 24)
    }

    pub const fn to_fourcc(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

/// Converts a Fourcc in 32-bit integer format into the matching pixel format.
///
/// # Examples
///
/// ```
/// # use dbm::PixelFormat;
/// // Fourcc representation of XRGB8888.
/// let xr24 = u32::from_le(0x34325258);
/// let f = PixelFormat::from(xr24);
/// assert_eq!(u32::from(f), xr24);
/// ```
impl From<u32> for PixelFormat {
    fn from(i: u32) -> Self {
        Self::from_u32(i)
    }
}

impl From<PixelFormat> for u32 {
    fn from(format: PixelFormat) -> Self {
        format.to_u32()
    }
}

/// Simple way to convert a string litteral (e.g. b"XR24") into a pixel format.
///
/// # Examples
///
/// ```
/// # use dbm::PixelFormat;
/// let xr24 = b"XR24";
/// let f = PixelFormat::from(xr24);
/// assert_eq!(&<[u8; 4]>::from(f), xr24);
/// ```
impl From<&[u8; 4]> for PixelFormat {
    fn from(n: &[u8; 4]) -> Self {
        Self::from_fourcc(n)
    }
}

impl From<PixelFormat> for [u8; 4] {
    fn from(format: PixelFormat) -> Self {
        format.to_fourcc()
    }
}

/// Produces a debug string for this PixelFormat, including its hexadecimal and string
/// representation.
///
/// # Examples
///
/// ```
/// # use dbm::PixelFormat;
/// let f = PixelFormat::from(b"XR24");
/// assert_eq!(format!("{:?}", f), "0x34325258 (XR24)");
/// ```
impl fmt::Debug for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_fmt(format_args!("0x{:08x} ({})", self.0, self))
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let fourcc = self
            .0
            .to_le_bytes()
            .iter()
            .map(|&x| x as char)
            .collect::<String>();
        f.write_str(fourcc.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, PixelFormat};
    use nix::errno::Errno;

    #[test]
    fn test_errno_conversion() {
        assert_eq!(Error::from(Errno::ENOMEM), Error::ResourceExhausted);
        assert_eq!(
            Error::from(Errno::EACCES),
            Error::KernelOperationFailed(Errno::EACCES)
        );

        assert_eq!(Errno::from(Error::InvalidArgument("size")), Errno::EINVAL);
        assert_eq!(Errno::from(Error::NoSuchDevice), Errno::ENODEV);
        assert_eq!(Errno::from(Error::Busy), Errno::EBUSY);
        assert_eq!(Errno::from(Error::ResourceExhausted), Errno::ENOMEM);
        assert_eq!(
            Errno::from(Error::KernelOperationFailed(Errno::ENOENT)),
            Errno::ENOENT
        );
    }

    #[test]
    fn test_pixel_format_display() {
        assert_eq!(PixelFormat::from(b"RG16").to_string(), "RG16");
        assert_eq!(PixelFormat::from(b"R8  ").to_string(), "R8  ");
    }
}
