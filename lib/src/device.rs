//! The buffer manager's entry point.
//!
//! A [`Device`] wraps a DRM file descriptor and hands out [`Buffer`]s. It owns the table of
//! GEM handle references and the lock protecting it: allocations, imports and buffer
//! destructions from any number of threads are serialized on that lock.
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{trace, warn};
use nix::unistd::{lseek, Whence};

use crate::backend::{DeviceBackend, DumbBackend};
use crate::buffer::Buffer;
use crate::format::{BoFormat, FormatInfo, UsageFlags, DEFAULT_FORMATS};
use crate::handles::HandleTable;
use crate::kernel::{DrmKernel, Kernel};
use crate::{Error, PixelFormat, Result};

/// Driver the default configuration expects to find behind the device.
pub const DEFAULT_DRIVER_NAME: &str = "omapdrm";

/// Creation parameters of a [`Device`].
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    driver_name: Option<String>,
    formats: Vec<FormatInfo>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            driver_name: Some(DEFAULT_DRIVER_NAME.into()),
            formats: DEFAULT_FORMATS.to_vec(),
        }
    }
}

impl DeviceConfig {
    pub fn new() -> Self {
        Default::default()
    }

    /// Only accept devices driven by `name`.
    pub fn driver_name(self, name: impl Into<String>) -> Self {
        DeviceConfig {
            driver_name: Some(name.into()),
            ..self
        }
    }

    /// Accept any DRM device, whatever its driver.
    pub fn any_driver(self) -> Self {
        DeviceConfig {
            driver_name: None,
            ..self
        }
    }

    /// Use `formats` as the capability table of the device.
    pub fn formats(self, formats: impl IntoIterator<Item = FormatInfo>) -> Self {
        DeviceConfig {
            formats: formats.into_iter().collect(),
            ..self
        }
    }
}

/// A DRM device buffers can be allocated from or imported into.
///
/// Buffers borrow the device they come from, so a device cannot be dropped while any of its
/// buffers is alive.
pub struct Device<K: Kernel> {
    kernel: K,
    formats: Vec<FormatInfo>,
    backend: Box<dyn DeviceBackend<K>>,
    handles: Mutex<HandleTable>,
}

impl<'fd> Device<DrmKernel<'fd>> {
    /// Creates a device from an open DRM file descriptor, using the default configuration.
    ///
    /// `fd` is borrowed for the lifetime of the device and is not closed when it is dropped.
    pub fn new(fd: BorrowedFd<'fd>) -> Result<Self> {
        Self::with_config(fd, DeviceConfig::default())
    }

    pub fn with_config(fd: BorrowedFd<'fd>, config: DeviceConfig) -> Result<Self> {
        Self::from_kernel(DrmKernel::new(fd), config)
    }

    /// Returns the DRM file descriptor this device was created from.
    pub fn fd(&self) -> BorrowedFd<'fd> {
        self.kernel.fd()
    }
}

impl<K: Kernel> Device<K> {
    /// Creates a device talking to the kernel through `kernel`.
    ///
    /// Fails with [`Error::NoSuchDevice`] if the driver cannot be identified or is not the one
    /// `config` expects.
    pub fn from_kernel(kernel: K, config: DeviceConfig) -> Result<Self> {
        trace!("creating device");

        let driver = kernel.driver_name().map_err(|e| {
            warn!("cannot identify DRM driver: {}", e);
            Error::NoSuchDevice
        })?;

        if let Some(expected) = &config.driver_name {
            if *expected != driver {
                warn!("unsupported DRM driver {} (expected {})", driver, expected);
                return Err(Error::NoSuchDevice);
            }
        }

        Ok(Device {
            kernel,
            formats: config.formats,
            backend: Box::new(DumbBackend::new()),
            handles: Mutex::new(HandleTable::new()),
        })
    }

    /// Replaces the allocation strategy of this device.
    pub fn with_backend(mut self, backend: impl DeviceBackend<K> + 'static) -> Self {
        self.backend = Box::new(backend);
        self
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// Returns the capability table of this device.
    pub fn formats(&self) -> &[FormatInfo] {
        &self.formats
    }

    /// Returns the number of distinct GEM handles currently referenced by buffers.
    pub fn num_live_handles(&self) -> usize {
        self.lock_handles().len()
    }

    /// Returns the number of buffers currently referencing `handle`.
    pub fn handle_refcount(&self, handle: u32) -> u32 {
        self.lock_handles().refcount(handle)
    }

    /// Takes the device lock.
    ///
    /// The table is only ever mutated through `HandleTable` methods, which leave it consistent
    /// even when they panic, so a poisoned lock is still usable.
    pub(crate) fn lock_handles(&self) -> MutexGuard<'_, HandleTable> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates a new buffer of `size` bytes for `usage`.
    pub fn allocate_buffer(&self, size: u32, usage: UsageFlags) -> Result<Buffer<'_, K>> {
        trace!("allocate_buffer size {}, usage {:?}", size, usage);

        if size == 0 {
            return Err(Error::InvalidArgument("buffer size cannot be zero"));
        }

        let mut handles = self.lock_handles();
        let handle = self.backend.create_buffer(&self.kernel, size, usage)?;
        self.wrap_handle(&mut handles, handle, size)
    }

    /// Imports the object with global name `name`, assuming it is `size` bytes large.
    pub fn import_by_name(&self, name: u32, size: u32) -> Result<Buffer<'_, K>> {
        trace!("import_by_name name {:#x}, size {}", name, size);

        let mut handles = self.lock_handles();
        let handle = self.kernel.open_name(name)?;
        self.wrap_handle(&mut handles, handle, size)
    }

    /// Imports the object behind the DMABUF descriptor `fd`.
    ///
    /// The size of the buffer is that of the descriptor, so `fd` must be seekable. It is not
    /// consumed: the caller remains responsible for closing it.
    pub fn import_by_fd(&self, fd: BorrowedFd<'_>) -> Result<Buffer<'_, K>> {
        let size = lseek(fd.as_raw_fd(), 0, Whence::SeekEnd)?;
        trace!("import_by_fd fd {}, size {}", fd.as_raw_fd(), size);

        let size =
            u32::try_from(size).map_err(|_| Error::InvalidArgument("DMABUF is too large"))?;

        let mut handles = self.lock_handles();
        let handle = self.kernel.fd_to_handle(fd)?;
        self.wrap_handle(&mut handles, handle, size)
    }

    /// Registers `handle` and builds a buffer around it. `handles` is the locked table.
    ///
    /// If the backend refuses the handle, the reference we took is dropped before returning,
    /// so the handle does not leak.
    fn wrap_handle<'a>(
        &'a self,
        handles: &mut HandleTable,
        handle: u32,
        size: u32,
    ) -> Result<Buffer<'a, K>> {
        handles.acquire(handle);

        if let Err(e) = self.backend.bind_buffer(handle, size) {
            if let Err(close_err) = handles.release(&self.kernel, handle) {
                warn!("failed to close GEM handle {}: {}", handle, close_err);
            }
            return Err(e);
        }

        Ok(Buffer::new(
            self,
            self.backend.buffer_backend(),
            handle,
            size,
        ))
    }

    /// Computes the stride and size in bytes of a `width`x`height` image with `bpp` bits per
    /// pixel, as the backend would lay it out for `usage`.
    pub fn query_stride_and_size(
        &self,
        width: u32,
        height: u32,
        bpp: u32,
        usage: UsageFlags,
    ) -> Result<(u32, u32)> {
        trace!(
            "query_stride_and_size {}x{}x{} usage {:?}",
            width,
            height,
            bpp,
            usage
        );

        if usage.is_empty() {
            return Err(Error::InvalidArgument("usage flags cannot be empty"));
        }

        self.backend.stride_and_size(width, height, bpp, usage)
    }

    /// Returns whether buffers of `format` with internal format `bo_format` can be used for
    /// `usage`.
    ///
    /// Only usages that are exactly `SCANOUT`, `CURSOR` or `RENDERING` are looked up in the
    /// capability table; any other non-empty usage is reported as supported (see
    /// [`UsageFlags::is_table_checked`]).
    pub fn supports(&self, format: PixelFormat, bo_format: BoFormat, usage: UsageFlags) -> bool {
        if usage.is_empty() {
            return false;
        }

        if !usage.is_table_checked() {
            return true;
        }

        self.formats
            .iter()
            .any(|info| info.allows(format, bo_format, usage))
    }
}

impl<K: Kernel> Drop for Device<K> {
    fn drop(&mut self) {
        trace!("destroying device");

        let handles = self.lock_handles();
        if !handles.is_empty() {
            warn!(
                "device destroyed with {} GEM handle(s) still referenced",
                handles.len()
            );
        }
    }
}

impl<'fd> AsFd for Device<DrmKernel<'fd>> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.kernel.as_fd()
    }
}

impl<'fd> AsRawFd for Device<DrmKernel<'fd>> {
    fn as_raw_fd(&self) -> RawFd {
        self.kernel.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Write;
    use std::os::unix::io::AsFd;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use nix::errno::Errno;

    use super::*;
    use crate::backend::BufferBackend;
    use crate::format::fourcc;
    use crate::kernel::fake::FakeKernel;

    fn device() -> Device<FakeKernel> {
        Device::from_kernel(FakeKernel::default(), DeviceConfig::default()).unwrap()
    }

    /// A file of `len` bytes standing in for a DMABUF.
    fn dmabuf_file(tag: &str, len: usize) -> (File, PathBuf) {
        let path = std::env::temp_dir().join(format!("dbm-{}-{}", tag, std::process::id()));
        let mut file = File::create(&path).unwrap();
        file.write_all(&vec![0xa5; len]).unwrap();
        (File::open(&path).unwrap(), path)
    }

    #[test]
    fn test_create_checks_driver() {
        assert!(Device::from_kernel(FakeKernel::default(), DeviceConfig::new()).is_ok());

        assert!(matches!(
            Device::from_kernel(FakeKernel::with_driver("i915"), DeviceConfig::new()),
            Err(Error::NoSuchDevice)
        ));

        assert!(Device::from_kernel(
            FakeKernel::with_driver("i915"),
            DeviceConfig::new().driver_name("i915")
        )
        .is_ok());

        assert!(Device::from_kernel(
            FakeKernel::with_driver("vc4"),
            DeviceConfig::new().any_driver()
        )
        .is_ok());
    }

    #[test]
    fn test_allocate_buffer() {
        let device = device();

        assert!(matches!(
            device.allocate_buffer(0, UsageFlags::SCANOUT),
            Err(Error::InvalidArgument(_))
        ));
        assert!(device.kernel().open_handles().is_empty());

        for size in [1, 4096, 640 * 480 * 4] {
            let buffer = device.allocate_buffer(size, UsageFlags::RENDERING).unwrap();
            assert_eq!(buffer.size(), size);
            assert_eq!(device.handle_refcount(buffer.handle()), 1);
            buffer.destroy().unwrap();
        }

        assert_eq!(device.num_live_handles(), 0);
        assert!(device.kernel().open_handles().is_empty());
    }

    #[test]
    fn test_allocate_buffer_kernel_failure() {
        let device = device();

        device.kernel().fail_create(Some(Errno::ENOMEM));
        assert!(matches!(
            device.allocate_buffer(4096, UsageFlags::SCANOUT),
            Err(Error::ResourceExhausted)
        ));

        device.kernel().fail_create(Some(Errno::EPERM));
        assert!(matches!(
            device.allocate_buffer(4096, UsageFlags::SCANOUT),
            Err(Error::KernelOperationFailed(Errno::EPERM))
        ));

        assert_eq!(device.num_live_handles(), 0);
    }

    #[test]
    fn test_import_by_name_shares_handle() {
        let device = device();
        let name = device.kernel().foreign_name();

        let first = device.import_by_name(name, 4096).unwrap();
        let second = device.import_by_name(name, 4096).unwrap();
        assert_eq!(first.handle(), second.handle());
        let handle = first.handle();
        assert_eq!(device.handle_refcount(handle), 2);

        first.destroy().unwrap();
        assert!(device.kernel().closed().is_empty());
        assert_eq!(device.handle_refcount(handle), 1);

        second.destroy().unwrap();
        assert_eq!(device.kernel().closed(), vec![handle]);
        assert_eq!(device.num_live_handles(), 0);
    }

    #[test]
    fn test_import_by_unknown_name() {
        let device = device();

        assert!(matches!(
            device.import_by_name(0xdead, 4096),
            Err(Error::KernelOperationFailed(Errno::ENOENT))
        ));
        assert_eq!(device.num_live_handles(), 0);
    }

    #[test]
    fn test_import_exported_name() {
        let device = device();
        let mut original = device.allocate_buffer(4096, UsageFlags::SCANOUT).unwrap();
        let name = original.export_name().unwrap();

        let imported = device.import_by_name(name, original.size()).unwrap();
        assert_eq!(imported.handle(), original.handle());
        assert_eq!(device.handle_refcount(original.handle()), 2);

        original.destroy().unwrap();
        imported.destroy().unwrap();
        assert_eq!(device.kernel().closed().len(), 1);
    }

    #[test]
    fn test_import_by_fd() {
        let device = device();
        let (file, path) = dmabuf_file("import", 8192);

        let first = device.import_by_fd(file.as_fd()).unwrap();
        assert_eq!(first.size(), 8192);
        let second = device.import_by_fd(file.as_fd()).unwrap();
        assert_eq!(second.handle(), first.handle());
        assert_eq!(device.handle_refcount(first.handle()), 2);

        let handle = first.handle();
        second.destroy().unwrap();
        assert!(device.kernel().closed().is_empty());
        first.destroy().unwrap();
        assert_eq!(device.kernel().closed(), vec![handle]);

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_import_by_fd_not_seekable() {
        let device = device();
        let (socket, _peer) = std::os::unix::net::UnixStream::pair().unwrap();

        assert!(matches!(
            device.import_by_fd(socket.as_fd()),
            Err(Error::KernelOperationFailed(Errno::ESPIPE))
        ));
        assert_eq!(device.num_live_handles(), 0);
    }

    /// Backend refusing to bind any buffer.
    struct PickyBackend;

    impl DeviceBackend<FakeKernel> for PickyBackend {
        fn stride_and_size(&self, _: u32, _: u32, _: u32, _: UsageFlags) -> Result<(u32, u32)> {
            Err(Error::InvalidArgument("unsupported layout"))
        }

        fn create_buffer(&self, kernel: &FakeKernel, size: u32, _: UsageFlags) -> Result<u32> {
            Ok(kernel.create_dumb(1, size, 8)?)
        }

        fn bind_buffer(&self, _handle: u32, _size: u32) -> Result<()> {
            Err(Error::ResourceExhausted)
        }

        fn buffer_backend(&self) -> &dyn BufferBackend<FakeKernel> {
            &DumbBackend
        }
    }

    #[test]
    fn test_failed_bind_closes_handle() {
        let device = device().with_backend(PickyBackend);

        assert!(matches!(
            device.allocate_buffer(4096, UsageFlags::SCANOUT),
            Err(Error::ResourceExhausted)
        ));
        assert_eq!(device.num_live_handles(), 0);
        assert_eq!(device.kernel().closed().len(), 1);
        assert!(device.kernel().open_handles().is_empty());

        let name = device.kernel().foreign_name();
        assert!(matches!(
            device.import_by_name(name, 4096),
            Err(Error::ResourceExhausted)
        ));
        assert_eq!(device.num_live_handles(), 0);
        assert_eq!(device.kernel().closed().len(), 2);
        assert!(device.kernel().open_handles().is_empty());
    }

    /// Backend accepting a fixed number of binds, then refusing the others.
    struct FlakyBackend {
        binds_left: AtomicUsize,
    }

    impl FlakyBackend {
        fn new(binds: usize) -> Self {
            FlakyBackend {
                binds_left: AtomicUsize::new(binds),
            }
        }
    }

    impl DeviceBackend<FakeKernel> for FlakyBackend {
        fn stride_and_size(&self, _: u32, _: u32, _: u32, _: UsageFlags) -> Result<(u32, u32)> {
            Err(Error::InvalidArgument("unsupported layout"))
        }

        fn create_buffer(&self, kernel: &FakeKernel, size: u32, _: UsageFlags) -> Result<u32> {
            Ok(kernel.create_dumb(1, size, 8)?)
        }

        fn bind_buffer(&self, _handle: u32, _size: u32) -> Result<()> {
            self.binds_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .map(drop)
                .map_err(|_| Error::ResourceExhausted)
        }

        fn buffer_backend(&self) -> &dyn BufferBackend<FakeKernel> {
            &DumbBackend
        }
    }

    #[test]
    fn test_failed_bind_keeps_shared_name_handle() {
        let device = device().with_backend(FlakyBackend::new(1));
        let name = device.kernel().foreign_name();

        let held = device.import_by_name(name, 4096).unwrap();
        let handle = held.handle();

        assert!(matches!(
            device.import_by_name(name, 4096),
            Err(Error::ResourceExhausted)
        ));
        assert_eq!(device.handle_refcount(handle), 1);
        assert!(device.kernel().closed().is_empty());
        assert_eq!(device.kernel().open_handles(), vec![handle]);

        held.destroy().unwrap();
        assert_eq!(device.kernel().closed(), vec![handle]);
        assert_eq!(device.num_live_handles(), 0);
    }

    #[test]
    fn test_failed_bind_keeps_shared_fd_handle() {
        let device = device().with_backend(FlakyBackend::new(1));
        let (file, path) = dmabuf_file("flaky", 4096);

        let held = device.import_by_fd(file.as_fd()).unwrap();
        let handle = held.handle();

        assert!(matches!(
            device.import_by_fd(file.as_fd()),
            Err(Error::ResourceExhausted)
        ));
        assert_eq!(device.handle_refcount(handle), 1);
        assert!(device.kernel().closed().is_empty());
        assert_eq!(device.kernel().open_handles(), vec![handle]);

        held.destroy().unwrap();
        assert_eq!(device.kernel().closed(), vec![handle]);
        assert_eq!(device.num_live_handles(), 0);

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_query_stride_and_size() {
        let device = device();

        assert_eq!(
            device.query_stride_and_size(13, 5, 24, UsageFlags::SCANOUT),
            Ok((48, 240))
        );
        assert_eq!(
            device.query_stride_and_size(13, 5, 24, UsageFlags::SCANOUT | UsageFlags::WRITE),
            Ok((48, 240))
        );
        assert!(matches!(
            device.query_stride_and_size(13, 5, 24, UsageFlags::empty()),
            Err(Error::InvalidArgument(_))
        ));

        let device = device.with_backend(PickyBackend);
        assert!(matches!(
            device.query_stride_and_size(13, 5, 24, UsageFlags::SCANOUT),
            Err(Error::InvalidArgument("unsupported layout"))
        ));
    }

    #[test]
    fn test_supports() {
        let device = device();

        // Empty usage is never supported.
        assert!(!device.supports(fourcc::XRGB8888, BoFormat::Xrgb8888, UsageFlags::empty()));

        // Single-purpose usages go through the table.
        for usage in [UsageFlags::SCANOUT, UsageFlags::CURSOR, UsageFlags::RENDERING] {
            assert!(device.supports(fourcc::XRGB8888, BoFormat::Xrgb8888, usage));
            assert!(device.supports(fourcc::ARGB8888, BoFormat::Xrgb8888, usage));
            assert!(device.supports(fourcc::ABGR8888, BoFormat::Xrgb8888, usage));
            assert!(device.supports(fourcc::RGB565, BoFormat::Xrgb8888, usage));

            assert!(!device.supports(fourcc::NV12, BoFormat::Xrgb8888, usage));
            assert!(!device.supports(fourcc::XRGB8888, BoFormat::Argb8888, usage));
        }

        // Anything else bypasses it.
        assert!(device.supports(
            fourcc::NV12,
            BoFormat::Argb8888,
            UsageFlags::SCANOUT | UsageFlags::RENDERING
        ));
        assert!(device.supports(fourcc::NV12, BoFormat::Argb8888, UsageFlags::WRITE));
        assert!(device.supports(fourcc::NV12, BoFormat::Argb8888, UsageFlags::PROTECTED));
    }

    #[test]
    fn test_supports_custom_table() {
        let config = DeviceConfig::new().formats([FormatInfo::new(
            fourcc::NV12,
            BoFormat::Xrgb8888,
            UsageFlags::RENDERING,
        )]);
        let device = Device::from_kernel(FakeKernel::default(), config).unwrap();
        assert_eq!(device.formats().len(), 1);

        assert!(device.supports(fourcc::NV12, BoFormat::Xrgb8888, UsageFlags::RENDERING));
        assert!(!device.supports(fourcc::NV12, BoFormat::Xrgb8888, UsageFlags::SCANOUT));
        assert!(!device.supports(fourcc::XRGB8888, BoFormat::Xrgb8888, UsageFlags::SCANOUT));
    }

    #[test]
    fn test_concurrent_allocations() {
        const NUM_THREADS: usize = 8;
        const NUM_ITERATIONS: usize = 200;

        let device = device();

        std::thread::scope(|s| {
            for _ in 0..NUM_THREADS {
                s.spawn(|| {
                    for i in 0..NUM_ITERATIONS {
                        let buffer = device
                            .allocate_buffer(4096 + i as u32, UsageFlags::SCANOUT)
                            .unwrap();
                        buffer.destroy().unwrap();
                    }
                });
            }
        });

        assert_eq!(device.num_live_handles(), 0);
        assert!(device.kernel().open_handles().is_empty());
        assert_eq!(device.kernel().closed().len(), NUM_THREADS * NUM_ITERATIONS);
    }

    #[test]
    fn test_concurrent_imports() {
        const NUM_THREADS: usize = 8;
        const NUM_ITERATIONS: usize = 200;

        let device = device();
        let mut original = device.allocate_buffer(4096, UsageFlags::SCANOUT).unwrap();
        let name = original.export_name().unwrap();
        let handle = original.handle();

        std::thread::scope(|s| {
            for _ in 0..NUM_THREADS {
                s.spawn(|| {
                    for _ in 0..NUM_ITERATIONS {
                        let buffer = device.import_by_name(name, 4096).unwrap();
                        assert_eq!(buffer.handle(), handle);
                        buffer.destroy().unwrap();
                    }
                });
            }
        });

        assert_eq!(device.handle_refcount(handle), 1);
        assert!(device.kernel().closed().is_empty());

        original.destroy().unwrap();
        assert_eq!(device.num_live_handles(), 0);
        assert_eq!(device.kernel().closed(), vec![handle]);
    }
}
