//! Buffer access, export and user data.
//!
//! Buffers are obtained from one of the `dbm_buffer_create*` functions of the [`crate::device`]
//! module and remain valid until given to [`dbm_buffer_destroy`].
#![allow(non_camel_case_types)]

use std::os::raw::{c_int, c_void};
use std::os::unix::io::IntoRawFd;
use std::ptr;

use dbm::kernel::DrmKernel;
use dbm::Buffer;
use log::{error, warn};

use crate::fail;

/// A buffer object. Opaque to C.
pub struct dbm_buffer {
    pub(crate) buffer: Buffer<'static, DrmKernel<'static>>,
}

/// Called with the buffer's user data when the buffer is destroyed.
pub type dbm_buffer_user_data_destroy_cb = extern "C" fn(*mut c_void);

/// User data pointer set by C clients.
struct CUserData(*mut c_void);

// Safe because the pointer is never dereferenced on our side, only handed back to the client,
// which is responsible for its thread safety.
unsafe impl Send for CUserData {}

/// Destroy `buf`, invoking its user data callback first.
///
/// The GEM handle of the buffer is closed unless other buffers of the same device still
/// reference it.
///
/// # Safety
///
/// `buf` must have been returned by one of the buffer creation functions and must not be
/// mapped. It must not be used after this call.
#[no_mangle]
pub unsafe extern "C" fn dbm_buffer_destroy(buf: *mut dbm_buffer) {
    if buf.is_null() {
        warn!("Trying to destroy a NULL buffer");
        return;
    }

    let buf = *Box::from_raw(buf);
    if let Err(e) = buf.buffer.destroy() {
        error!("Error while destroying buffer: {}", e);
    }
}

/// Map `buf` for CPU access and return the address of its content.
///
/// `read` and `write` tell what the CPU is going to do with the buffer. Returns NULL and sets
/// `errno` on failure, in particular `EBUSY` if the buffer is already mapped.
///
/// # Safety
///
/// `buf` must be a valid buffer.
#[no_mangle]
pub unsafe extern "C" fn dbm_buffer_cpu_access_prepare(
    buf: *mut dbm_buffer,
    read: bool,
    write: bool,
) -> *mut c_void {
    assert!(!buf.is_null());
    let buf = &mut *buf;

    match buf.buffer.begin_cpu_access(read, write) {
        Ok(data) => data.as_ptr() as *mut c_void,
        Err(e) => {
            fail("dbm_buffer_cpu_access_prepare", e);
            ptr::null_mut()
        }
    }
}

/// End CPU access to `buf`. Does nothing if the buffer is not mapped.
///
/// # Safety
///
/// `buf` must be a valid buffer. The address returned by [`dbm_buffer_cpu_access_prepare`]
/// must not be used after this call.
#[no_mangle]
pub unsafe extern "C" fn dbm_buffer_cpu_access_finish(buf: *mut dbm_buffer) {
    assert!(!buf.is_null());
    (*buf).buffer.end_cpu_access();
}

/// # Safety
///
/// `buf` must be a valid buffer.
#[no_mangle]
pub unsafe extern "C" fn dbm_buffer_get_handle(buf: *const dbm_buffer) -> u32 {
    assert!(!buf.is_null());
    (*buf).buffer.handle()
}

/// Return the global name of `buf`, or 0 if it could not be created.
///
/// # Safety
///
/// `buf` must be a valid buffer.
#[no_mangle]
pub unsafe extern "C" fn dbm_buffer_get_name(buf: *mut dbm_buffer) -> u32 {
    assert!(!buf.is_null());

    match (*buf).buffer.export_name() {
        Ok(name) => name,
        Err(e) => {
            fail("dbm_buffer_get_name", e);
            0
        }
    }
}

/// Export `buf` as a new DMABUF file descriptor, which the caller must close. Returns -1 on
/// failure.
///
/// # Safety
///
/// `buf` must be a valid buffer.
#[no_mangle]
pub unsafe extern "C" fn dbm_buffer_get_fd(buf: *const dbm_buffer) -> c_int {
    assert!(!buf.is_null());

    match (*buf).buffer.export_fd() {
        Ok(fd) => fd.into_raw_fd(),
        Err(e) => {
            fail("dbm_buffer_get_fd", e);
            -1
        }
    }
}

/// # Safety
///
/// `buf` must be a valid buffer.
#[no_mangle]
pub unsafe extern "C" fn dbm_buffer_get_size(buf: *const dbm_buffer) -> u32 {
    assert!(!buf.is_null());
    (*buf).buffer.size()
}

/// Return the user data last set with [`dbm_buffer_set_user_data`], or NULL.
///
/// # Safety
///
/// `buf` must be a valid buffer.
#[no_mangle]
pub unsafe extern "C" fn dbm_buffer_get_user_data(buf: *const dbm_buffer) -> *mut c_void {
    assert!(!buf.is_null());

    (*buf)
        .buffer
        .user_data()
        .and_then(|data| data.downcast_ref::<CUserData>())
        .map_or(ptr::null_mut(), |data| data.0)
}

/// Attach `user_data` to `buf`. If `destroy_cb` is not NULL, it will be called with `user_data`
/// when the buffer is destroyed.
///
/// Any previous user data is replaced, and its callback is not called.
///
/// # Safety
///
/// `buf` must be a valid buffer.
#[no_mangle]
pub unsafe extern "C" fn dbm_buffer_set_user_data(
    buf: *mut dbm_buffer,
    user_data: *mut c_void,
    destroy_cb: Option<dbm_buffer_user_data_destroy_cb>,
) {
    assert!(!buf.is_null());

    let callback = destroy_cb.map(|cb| -> dbm::buffer::DestroyCallback {
        Box::new(move |data| {
            let ptr = data
                .and_then(|data| data.downcast::<CUserData>().ok())
                .map_or(ptr::null_mut(), |data| data.0);
            cb(ptr);
        })
    });

    (*buf)
        .buffer
        .set_user_data(Some(Box::new(CUserData(user_data))), callback);
}
