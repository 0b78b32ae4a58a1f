//! Shared internal utilities for the interceptors.

use std::ffi::{CStr, c_char};
use std::fmt;
use std::io::Write as _;

use envtrace_core::config::DIAGNOSTIC_PREFIX;

use crate::errno_abi;

/// Borrow the bytes of a C string, `None` for NULL.
///
/// # Safety
///
/// A non-null `ptr` must point to a NUL-terminated string that stays alive
/// and unmodified for `'a`.
#[inline]
pub(crate) unsafe fn c_bytes<'a>(ptr: *const c_char) -> Option<&'a [u8]> {
    if ptr.is_null() {
        None
    } else {
        Some(unsafe { CStr::from_ptr(ptr) }.to_bytes())
    }
}

/// Write `envtrace: <message>` to file descriptor 2.
///
/// Goes straight to `write(2)`: the error stream may be needed while the
/// process is about to die, and nothing here may re-enter an interceptor.
pub(crate) fn diagnostic(args: fmt::Arguments<'_>) {
    let mut line = Vec::with_capacity(128);
    let _ = writeln!(line, "{DIAGNOSTIC_PREFIX}: {args}");

    let mut rest = &line[..];
    while !rest.is_empty() {
        // SAFETY: `rest` is a live, initialized buffer.
        let n = unsafe { libc::write(libc::STDERR_FILENO, rest.as_ptr().cast(), rest.len()) };
        if n < 0 && errno_abi::errno() == libc::EINTR {
            continue;
        }
        if n <= 0 {
            break;
        }
        rest = &rest[n as usize..];
    }
}
