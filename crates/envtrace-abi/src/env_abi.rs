//! ABI layer for the environment functions (`getenv`, `setenv`, `unsetenv`).
//!
//! All three hold the record lock across the original call, so the prior
//! value logged by `setenv`/`unsetenv` is the one the mutation replaced and
//! no other thread's record can land between the read and the write.

use std::ffi::{c_char, c_int};

use envtrace_core::CallKind;
use envtrace_core::record::CallDetail;

use crate::resolver::{GetenvFn, SetenvFn, UnsetenvFn};
use crate::tracer::{Tracer, tracer};
use crate::util::c_bytes;

// ---------------------------------------------------------------------------
// getenv
// ---------------------------------------------------------------------------

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn getenv(name: *const c_char) -> *mut c_char {
    unsafe { traced_getenv(tracer(), name) }
}

pub unsafe fn traced_getenv(t: &Tracer, name: *const c_char) -> *mut c_char {
    let real: GetenvFn = unsafe { t.prepare(CallKind::Getenv) };
    let _order = t.exclusive();
    let value = unsafe { real(name) };
    t.emit(CallDetail::Getenv {
        name: unsafe { c_bytes(name) },
        value: unsafe { c_bytes(value) },
    });
    value
}

// ---------------------------------------------------------------------------
// setenv
// ---------------------------------------------------------------------------

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn setenv(
    name: *const c_char,
    value: *const c_char,
    overwrite: c_int,
) -> c_int {
    unsafe { traced_setenv(tracer(), name, value, overwrite) }
}

pub unsafe fn traced_setenv(
    t: &Tracer,
    name: *const c_char,
    value: *const c_char,
    overwrite: c_int,
) -> c_int {
    let real: SetenvFn = unsafe { t.prepare(CallKind::Setenv) };
    let _order = t.exclusive();
    let prior = unsafe { t.prior_value(name) };
    let rc = unsafe { real(name, value, overwrite) };
    t.emit(CallDetail::Setenv {
        name: unsafe { c_bytes(name) },
        prior: prior.as_deref(),
        value: unsafe { c_bytes(value) },
        result: rc,
    });
    rc
}

// ---------------------------------------------------------------------------
// unsetenv
// ---------------------------------------------------------------------------

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn unsetenv(name: *const c_char) -> c_int {
    unsafe { traced_unsetenv(tracer(), name) }
}

pub unsafe fn traced_unsetenv(t: &Tracer, name: *const c_char) -> c_int {
    let real: UnsetenvFn = unsafe { t.prepare(CallKind::Unsetenv) };
    let _order = t.exclusive();
    let prior = unsafe { t.prior_value(name) };
    let rc = unsafe { real(name) };
    t.emit(CallDetail::Unsetenv {
        name: unsafe { c_bytes(name) },
        prior: prior.as_deref(),
        result: rc,
    });
    rc
}
