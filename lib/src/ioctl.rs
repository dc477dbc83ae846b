//! This module provides safer versions of the DRM ioctls used to manage GEM objects, through
//! simple functions working on anything implementing `AsRawFd`.
//!
//! DRM ioctls take a single structure as argument, which serves to store both the input and the
//! output of the call. Each proxy function here takes the relevant input as parameters, fills the
//! kernel structure itself, and returns only the fields the driver is supposed to write.
//!
//! Every ioctl has its own error type. This lets callers discern error codes that have a specific
//! meaning for a given ioctl (e.g. `ENOENT` for an unknown global name in `GEM_OPEN`) from
//! generic failures, captured by the `IoctlError` variant. All error types can be converted back
//! to their original error code using their `Into<Errno>` implementation.
//!
//! Like libdrm, calls interrupted by a signal (`EINTR`) or reporting `EAGAIN` are restarted
//! transparently.

mod dumb;
mod gem;
mod mmap;
mod prime;
mod version;

pub use dumb::*;
pub use gem::*;
pub use mmap::*;
pub use prime::*;
pub use version::*;

use nix::errno::Errno;
use std::os::raw::c_int;

/// Runs `f` until it returns something else than `EINTR` or `EAGAIN`.
fn drm_ioctl<F>(mut f: F) -> nix::Result<c_int>
where
    F: FnMut() -> nix::Result<c_int>,
{
    loop {
        match f() {
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
            res => return res,
        }
    }
}
