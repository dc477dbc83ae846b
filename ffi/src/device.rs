//! Device creation, buffer allocation and import, and format queries.
#![allow(non_camel_case_types)]

use std::os::raw::c_int;
use std::os::unix::io::BorrowedFd;
use std::ptr;

use dbm::kernel::DrmKernel;
use dbm::{bpp_from_pixel_format, BoFormat, Device, PixelFormat, UsageFlags};
use log::{error, warn};
use nix::errno::Errno;

use crate::buffer::dbm_buffer;
use crate::{fail, set_errno};

/// A DRM device. Opaque to C.
pub struct dbm_device {
    pub(crate) device: Device<DrmKernel<'static>>,
}

/// Create a device from the open DRM file descriptor `fd`.
///
/// Returns NULL and sets `errno` to `ENODEV` if `fd` is not an omapdrm device.
///
/// # Safety
///
/// `fd` must remain open until the device is given to [`dbm_device_destroy`].
#[no_mangle]
pub unsafe extern "C" fn dbm_device_create(fd: c_int) -> *mut dbm_device {
    if fd < 0 {
        set_errno(Errno::ENODEV);
        return ptr::null_mut();
    }

    match Device::new(BorrowedFd::borrow_raw(fd)) {
        Ok(device) => Box::into_raw(Box::new(dbm_device { device })),
        Err(e) => {
            fail("dbm_device_create", e);
            ptr::null_mut()
        }
    }
}

/// Destroy `dev`. The file descriptor it was created from is not closed.
///
/// # Safety
///
/// `dev` must have been returned by [`dbm_device_create`], and all its buffers must have been
/// destroyed. It must not be used after this call.
#[no_mangle]
pub unsafe extern "C" fn dbm_device_destroy(dev: *mut dbm_device) {
    if dev.is_null() {
        warn!("Trying to destroy a NULL device");
        return;
    }

    drop(Box::from_raw(dev));
}

/// Wrap a freshly created or imported buffer for C.
fn into_c_buffer(
    op: &str,
    res: dbm::Result<dbm::Buffer<'static, DrmKernel<'static>>>,
) -> *mut dbm_buffer {
    match res {
        Ok(buffer) => Box::into_raw(Box::new(dbm_buffer { buffer })),
        Err(e) => {
            fail(op, e);
            ptr::null_mut()
        }
    }
}

/// Allocate a buffer of `size` bytes for the `GBM_BO_USE_*` usage `flags`.
///
/// # Safety
///
/// `dev` must be a valid device, which must outlive the returned buffer.
#[no_mangle]
pub unsafe extern "C" fn dbm_buffer_create(
    dev: *const dbm_device,
    size: u32,
    flags: u32,
) -> *mut dbm_buffer {
    assert!(!dev.is_null());
    let dev: &'static dbm_device = &*dev;

    into_c_buffer(
        "dbm_buffer_create",
        dev.device
            .allocate_buffer(size, UsageFlags::from_bits_retain(flags)),
    )
}

/// Import the buffer with global name `name`, which is `size` bytes large.
///
/// # Safety
///
/// `dev` must be a valid device, which must outlive the returned buffer.
#[no_mangle]
pub unsafe extern "C" fn dbm_buffer_from_name(
    dev: *const dbm_device,
    name: u32,
    size: u32,
) -> *mut dbm_buffer {
    assert!(!dev.is_null());
    let dev: &'static dbm_device = &*dev;

    into_c_buffer("dbm_buffer_from_name", dev.device.import_by_name(name, size))
}

/// Import the DMABUF `fd`. The descriptor is not consumed.
///
/// # Safety
///
/// `dev` must be a valid device, which must outlive the returned buffer.
#[no_mangle]
pub unsafe extern "C" fn dbm_buffer_from_fd(dev: *const dbm_device, fd: c_int) -> *mut dbm_buffer {
    assert!(!dev.is_null());
    let dev: &'static dbm_device = &*dev;

    if fd < 0 {
        set_errno(Errno::EBADF);
        return ptr::null_mut();
    }

    into_c_buffer(
        "dbm_buffer_from_fd",
        dev.device.import_by_fd(BorrowedFd::borrow_raw(fd)),
    )
}

/// Compute the stride and size of a `width`x`height` image with `bpp` bits per pixel.
///
/// `layout` is reserved and must be 0. Returns 0 on success, -1 with `errno` set otherwise, in
/// which case `stride` and `size` are left untouched.
///
/// # Safety
///
/// `dev` must be a valid device, `stride` and `size` must point to writable memory.
#[no_mangle]
pub unsafe extern "C" fn dbm_get_buffer_stride_and_size(
    dev: *const dbm_device,
    width: u32,
    height: u32,
    bpp: u32,
    layout: u32,
    flags: u32,
    stride: *mut u32,
    size: *mut u32,
) -> c_int {
    assert!(!dev.is_null());
    assert!(!stride.is_null());
    assert!(!size.is_null());
    let dev = &*dev;

    let res = if layout != 0 {
        Err(dbm::Error::InvalidArgument("unsupported layout"))
    } else {
        dev.device
            .query_stride_and_size(width, height, bpp, UsageFlags::from_bits_retain(flags))
    };

    match res {
        Ok((s, sz)) => {
            *stride = s;
            *size = sz;
            0
        }
        Err(e) => {
            fail("dbm_get_buffer_stride_and_size", e);
            -1
        }
    }
}

/// Return whether buffers of pixel format `fourcc` and `gbm_bo_format` `format` can be used for
/// `flags`.
///
/// # Safety
///
/// `dev` must be a valid device.
#[no_mangle]
pub unsafe extern "C" fn dbm_is_format_and_layout_supported(
    dev: *const dbm_device,
    fourcc: u32,
    format: u32,
    flags: u32,
) -> bool {
    assert!(!dev.is_null());
    let dev = &*dev;
    let usage = UsageFlags::from_bits_retain(flags);

    match BoFormat::n(format) {
        Some(bo_format) => dev
            .device
            .supports(PixelFormat::from(fourcc), bo_format, usage),
        // Cannot be in the table, but non-table usages are accepted for anything.
        None => !usage.is_empty() && !usage.is_table_checked(),
    }
}

/// Return the number of bits per pixel of `fourcc`, or -1 if the format is unknown.
#[no_mangle]
pub extern "C" fn dbm_bpp_from_pixel_format(fourcc: c_int) -> c_int {
    match bpp_from_pixel_format(PixelFormat::from(fourcc as u32)) {
        Some(bpp) => bpp as c_int,
        None => {
            error!("unknown pixel format {:#010x}", fourcc);
            -1
        }
    }
}
