//! Access to the calling thread's `errno`.
//!
//! Interceptors must hand back exactly the `errno` the original call left
//! behind, so every piece of bookkeeping that can touch it runs between a
//! [`errno`] snapshot and a [`set_errno`] restore.

use std::ffi::c_int;

#[inline]
pub fn errno() -> c_int {
    // SAFETY: `__errno_location` returns this thread's errno slot.
    unsafe { *libc::__errno_location() }
}

#[inline]
pub fn set_errno(val: c_int) {
    // SAFETY: as above; the slot is valid for writes on this thread.
    unsafe { *libc::__errno_location() = val };
}
