//! C FFI of the dbm crate.
//!
//! This crate exposes the buffer manager through the same C API as libdbm, so existing clients
//! can link against it unchanged. Functions report failures through their return value and
//! `errno`.

pub mod buffer;
pub mod device;

use std::os::raw::c_int;

use nix::errno::Errno;

static INIT: std::sync::Once = std::sync::Once::new();

/// Initialize the dbm library. This only sets up the proper hooks for logging, so although it
/// is not a hard requirement to call this function, failure to do so will result in no logs
/// being printed.
#[no_mangle]
pub extern "C" fn dbm_init() {
    INIT.call_once(|| {
        #[cfg(feature = "env_logger")]
        env_logger::builder().format_timestamp(None).init();

        #[cfg(feature = "android")]
        android_logger::init_once(
            android_logger::Config::default().with_min_level(log::Level::Trace),
        );
    });
}

#[cfg(not(target_os = "android"))]
unsafe fn errno_location() -> *mut c_int {
    nix::libc::__errno_location()
}

#[cfg(target_os = "android")]
unsafe fn errno_location() -> *mut c_int {
    nix::libc::__errno()
}

/// Sets the calling thread's `errno` to `errno`.
fn set_errno(errno: Errno) {
    // Safe because the errno location is always a valid, thread-local integer.
    unsafe { *errno_location() = errno as c_int };
}

/// Reports `err` through `errno` and logs it.
fn fail(op: &str, err: dbm::Error) {
    log::debug!("{} failed: {}", op, err);
    set_errno(Errno::from(err));
}
