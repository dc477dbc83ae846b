//! Access to the kernel graphics subsystem.
//!
//! The buffer manager never issues system calls itself: everything goes through the [`Kernel`]
//! trait, which [`DrmKernel`] implements on top of the [`crate::ioctl`] module. Errors are
//! reported as the raw `Errno` returned by the kernel.
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::ptr::NonNull;

use log::trace;

use crate::ioctl::{self, PrimeFlags};

/// Operations the buffer manager needs from the kernel.
///
/// All handles are local to the DRM file description the implementation talks to.
pub trait Kernel: Send + Sync {
    /// Returns the name of the driver behind the device.
    fn driver_name(&self) -> nix::Result<String>;

    /// Allocates a linear buffer of `width`x`height` pixels of `bpp` bits and returns its
    /// handle.
    fn create_dumb(&self, width: u32, height: u32, bpp: u32) -> nix::Result<u32>;

    /// Opens the object with global name `name` and returns its handle.
    fn open_name(&self, name: u32) -> nix::Result<u32>;

    /// Returns a handle for the object behind the DMABUF descriptor `dmabuf`.
    fn fd_to_handle(&self, dmabuf: BorrowedFd<'_>) -> nix::Result<u32>;

    /// Exports `handle` as a new DMABUF descriptor.
    fn handle_to_fd(&self, handle: u32, flags: PrimeFlags) -> nix::Result<OwnedFd>;

    /// Maps the first `size` bytes of `handle` into our address space, read-write.
    fn map(&self, handle: u32, size: usize) -> nix::Result<NonNull<u8>>;

    /// Unmaps a range previously returned by [`Kernel::map`].
    ///
    /// # Safety
    ///
    /// `data` and `size` must come from a successful call to `map` and the range must not be
    /// accessed afterwards.
    unsafe fn unmap(&self, data: NonNull<u8>, size: usize) -> nix::Result<()>;

    /// Returns a global name for `handle`, creating it if needed.
    fn flink(&self, handle: u32) -> nix::Result<u32>;

    /// Closes `handle`.
    fn close(&self, handle: u32) -> nix::Result<()>;
}

/// [`Kernel`] implementation issuing DRM ioctls on a borrowed device descriptor.
///
/// The descriptor is never closed by this type: its owner must keep it open for as long as the
/// `DrmKernel` lives.
#[derive(Debug, Clone, Copy)]
pub struct DrmKernel<'fd> {
    fd: BorrowedFd<'fd>,
}

impl<'fd> DrmKernel<'fd> {
    pub fn new(fd: BorrowedFd<'fd>) -> Self {
        Self { fd }
    }

    pub fn fd(&self) -> BorrowedFd<'fd> {
        self.fd
    }
}

impl<'fd> AsFd for DrmKernel<'fd> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd
    }
}

impl<'fd> AsRawFd for DrmKernel<'fd> {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl<'fd> Kernel for DrmKernel<'fd> {
    fn driver_name(&self) -> nix::Result<String> {
        let version = ioctl::version(&self.fd)?;
        trace!(
            "DRM driver {} {}.{}.{} ({})",
            version.name,
            version.major,
            version.minor,
            version.patchlevel,
            version.desc
        );

        Ok(version.name)
    }

    fn create_dumb(&self, width: u32, height: u32, bpp: u32) -> nix::Result<u32> {
        Ok(ioctl::create_dumb(&self.fd, width, height, bpp)?.handle)
    }

    fn open_name(&self, name: u32) -> nix::Result<u32> {
        Ok(ioctl::gem_open(&self.fd, name)?.handle)
    }

    fn fd_to_handle(&self, dmabuf: BorrowedFd<'_>) -> nix::Result<u32> {
        Ok(ioctl::prime_fd_to_handle(&self.fd, &dmabuf)?)
    }

    fn handle_to_fd(&self, handle: u32, flags: PrimeFlags) -> nix::Result<OwnedFd> {
        Ok(ioctl::prime_handle_to_fd(&self.fd, handle, flags)?)
    }

    fn map(&self, handle: u32, size: usize) -> nix::Result<NonNull<u8>> {
        let offset = ioctl::map_dumb(&self.fd, handle)?;

        // Safe because the mapping is only released through `unmap`, whose contract requires it
        // not to be used afterwards.
        Ok(unsafe { ioctl::mmap(&self.fd, offset, size) }?)
    }

    unsafe fn unmap(&self, data: NonNull<u8>, size: usize) -> nix::Result<()> {
        ioctl::munmap(data, size)
    }

    fn flink(&self, handle: u32) -> nix::Result<u32> {
        Ok(ioctl::gem_flink(&self.fd, handle)?)
    }

    fn close(&self, handle: u32) -> nix::Result<()> {
        Ok(ioctl::gem_close(&self.fd, handle)?)
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory stand-in for the kernel, recording the calls made to it.
    use std::collections::{BTreeMap, BTreeSet, HashMap};
    use std::fs::File;
    use std::os::unix::io::{BorrowedFd, OwnedFd};
    use std::ptr::NonNull;
    use std::sync::Mutex;

    use nix::errno::Errno;

    use super::Kernel;
    use crate::ioctl::PrimeFlags;

    #[derive(Default)]
    struct State {
        next_handle: u32,
        next_name: u32,
        /// Currently open handles.
        open: BTreeSet<u32>,
        /// Global name of each handle that has been flinked.
        names: BTreeMap<u32, u32>,
        /// Handle imported for each DMABUF inode.
        dmabufs: HashMap<u64, u32>,
        /// Backing memory of each live mapping, keyed by address.
        mappings: HashMap<usize, Box<[u8]>>,
        closed: Vec<u32>,
        flink_calls: usize,
        fail_create: Option<Errno>,
        fail_map: Option<Errno>,
        fail_close: Option<Errno>,
        fail_flink: Option<Errno>,
    }

    pub(crate) struct FakeKernel {
        driver: String,
        state: Mutex<State>,
    }

    impl Default for FakeKernel {
        fn default() -> Self {
            Self::with_driver("omapdrm")
        }
    }

    impl FakeKernel {
        pub(crate) fn with_driver(driver: &str) -> Self {
            let _ = env_logger::builder().is_test(true).try_init();

            Self {
                driver: driver.into(),
                state: Mutex::new(State {
                    next_handle: 1,
                    next_name: 1,
                    ..Default::default()
                }),
            }
        }

        fn state(&self) -> std::sync::MutexGuard<'_, State> {
            self.state.lock().unwrap()
        }

        /// Handles closed so far, in order.
        pub(crate) fn closed(&self) -> Vec<u32> {
            self.state().closed.clone()
        }

        pub(crate) fn open_handles(&self) -> Vec<u32> {
            self.state().open.iter().copied().collect()
        }

        pub(crate) fn live_mappings(&self) -> usize {
            self.state().mappings.len()
        }

        pub(crate) fn flink_calls(&self) -> usize {
            self.state().flink_calls
        }

        pub(crate) fn fail_create(&self, errno: Option<Errno>) {
            self.state().fail_create = errno;
        }

        pub(crate) fn fail_map(&self, errno: Option<Errno>) {
            self.state().fail_map = errno;
        }

        pub(crate) fn fail_close(&self, errno: Option<Errno>) {
            self.state().fail_close = errno;
        }

        pub(crate) fn fail_flink(&self, errno: Option<Errno>) {
            self.state().fail_flink = errno;
        }

        /// Pretends another process exported a new object under a global name, and returns
        /// that name.
        pub(crate) fn foreign_name(&self) -> u32 {
            let mut state = self.state();
            let handle = state.next_handle;
            state.next_handle += 1;
            let name = state.next_name;
            state.next_name += 1;
            state.names.insert(handle, name);
            name
        }

        fn new_handle(state: &mut State) -> u32 {
            let handle = state.next_handle;
            state.next_handle += 1;
            state.open.insert(handle);
            handle
        }
    }

    fn inode_of(fd: BorrowedFd<'_>) -> nix::Result<u64> {
        let file = File::from(fd.try_clone_to_owned().map_err(|_| Errno::EBADF)?);
        let metadata = file.metadata().map_err(|_| Errno::EBADF)?;
        Ok(std::os::unix::fs::MetadataExt::ino(&metadata))
    }

    impl Kernel for FakeKernel {
        fn driver_name(&self) -> nix::Result<String> {
            Ok(self.driver.clone())
        }

        fn create_dumb(&self, width: u32, height: u32, bpp: u32) -> nix::Result<u32> {
            let mut state = self.state();
            if let Some(errno) = state.fail_create {
                return Err(errno);
            }
            if width == 0 || height == 0 || bpp == 0 {
                return Err(Errno::EINVAL);
            }

            Ok(Self::new_handle(&mut state))
        }

        fn open_name(&self, name: u32) -> nix::Result<u32> {
            let mut state = self.state();
            let handle = state
                .names
                .iter()
                .find(|(_, n)| **n == name)
                .map(|(h, _)| *h)
                .ok_or(Errno::ENOENT)?;
            state.open.insert(handle);

            Ok(handle)
        }

        fn fd_to_handle(&self, dmabuf: BorrowedFd<'_>) -> nix::Result<u32> {
            let inode = inode_of(dmabuf)?;
            let mut state = self.state();
            let handle = match state.dmabufs.get(&inode) {
                Some(handle) => *handle,
                None => {
                    let handle = Self::new_handle(&mut state);
                    state.dmabufs.insert(inode, handle);
                    handle
                }
            };
            state.open.insert(handle);

            Ok(handle)
        }

        fn handle_to_fd(&self, handle: u32, flags: PrimeFlags) -> nix::Result<OwnedFd> {
            assert!(flags.contains(PrimeFlags::CLOEXEC));
            if !self.state().open.contains(&handle) {
                return Err(Errno::ENOENT);
            }

            let file = File::open("/dev/null").map_err(|_| Errno::EMFILE)?;
            Ok(OwnedFd::from(file))
        }

        fn map(&self, handle: u32, size: usize) -> nix::Result<NonNull<u8>> {
            let mut state = self.state();
            if let Some(errno) = state.fail_map {
                return Err(errno);
            }
            if !state.open.contains(&handle) {
                return Err(Errno::ENOENT);
            }

            let mut memory = vec![0u8; size].into_boxed_slice();
            let data = NonNull::new(memory.as_mut_ptr()).ok_or(Errno::EFAULT)?;
            state.mappings.insert(data.as_ptr() as usize, memory);

            Ok(data)
        }

        unsafe fn unmap(&self, data: NonNull<u8>, size: usize) -> nix::Result<()> {
            let mut state = self.state();
            match state.mappings.remove(&(data.as_ptr() as usize)) {
                Some(memory) if memory.len() == size => Ok(()),
                _ => Err(Errno::EINVAL),
            }
        }

        fn flink(&self, handle: u32) -> nix::Result<u32> {
            let mut state = self.state();
            state.flink_calls += 1;
            if let Some(errno) = state.fail_flink {
                return Err(errno);
            }
            if !state.open.contains(&handle) {
                return Err(Errno::ENOENT);
            }

            if let Some(name) = state.names.get(&handle) {
                return Ok(*name);
            }
            let name = state.next_name;
            state.next_name += 1;
            state.names.insert(handle, name);

            Ok(name)
        }

        fn close(&self, handle: u32) -> nix::Result<()> {
            let mut state = self.state();
            state.closed.push(handle);
            if !state.open.remove(&handle) {
                return Err(Errno::EINVAL);
            }

            match state.fail_close {
                Some(errno) => Err(errno),
                None => Ok(()),
            }
        }
    }
}
