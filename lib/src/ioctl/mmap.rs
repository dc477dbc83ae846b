use std::num::NonZeroUsize;
use std::os::unix::io::AsFd;
use std::ptr::NonNull;

use nix::errno::Errno;
use nix::libc::off_t;
use nix::sys::mman;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MmapError {
    #[error("cannot map an empty range")]
    EmptyRange,
    #[error("mmap error: {0}")]
    MmapError(#[from] Errno),
}

impl From<MmapError> for Errno {
    fn from(err: MmapError) -> Self {
        match err {
            MmapError::EmptyRange => Errno::EINVAL,
            MmapError::MmapError(e) => e,
        }
    }
}

/// Maps `length` bytes of `fd` starting at `offset` read-write and shared.
///
/// For DRM devices, `offset` is the fake offset returned by [`super::map_dumb`].
///
/// # Safety
///
/// The returned pointer is valid until passed to [`munmap`] with the same `length`. The caller
/// must not access it past that point.
pub unsafe fn mmap(fd: &impl AsFd, offset: u64, length: usize) -> Result<NonNull<u8>, MmapError> {
    let length = NonZeroUsize::new(length).ok_or(MmapError::EmptyRange)?;
    let offset = off_t::try_from(offset).map_err(|_| MmapError::MmapError(Errno::EOVERFLOW))?;

    let data = mman::mmap(
        None,
        length,
        mman::ProtFlags::PROT_READ | mman::ProtFlags::PROT_WRITE,
        mman::MapFlags::MAP_SHARED,
        fd,
        offset,
    )?;

    Ok(data.cast())
}

/// Unmaps a range previously returned by [`mmap`].
///
/// # Safety
///
/// `data` and `length` must come from a successful call to [`mmap`], and the range must not be
/// used after this call.
pub unsafe fn munmap(data: NonNull<u8>, length: usize) -> Result<(), Errno> {
    mman::munmap(data.cast(), length)
}
