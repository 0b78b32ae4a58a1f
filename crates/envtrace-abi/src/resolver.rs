//! Lazy lookup of the original libc entry points.
//!
//! Each intercepted symbol owns one atomic slot. The fast path is a single
//! acquire load; the first caller for a slot takes the init lock, asks the
//! dynamic linker for the *next* definition (`RTLD_NEXT`) and publishes it.
//! Slots are written once and never cleared, so a pointer read from a slot
//! stays valid for the life of the process.

use std::cell::UnsafeCell;
use std::ffi::{c_char, c_int, c_void};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

use envtrace_core::{CallKind, TraceError};
use libc::{mode_t, pid_t};
use parking_lot::ReentrantMutex;

// ---------------------------------------------------------------------------
// C prototypes of the originals
// ---------------------------------------------------------------------------

pub type GetenvFn = unsafe extern "C" fn(*const c_char) -> *mut c_char;
pub type SetenvFn = unsafe extern "C" fn(*const c_char, *const c_char, c_int) -> c_int;
pub type UnsetenvFn = unsafe extern "C" fn(*const c_char) -> c_int;
pub type ForkFn = unsafe extern "C" fn() -> pid_t;
/// Entry point run by the child of `clone`.
pub type CloneCallback = Option<unsafe extern "C" fn(*mut c_void) -> c_int>;
pub type CloneFn =
    unsafe extern "C" fn(CloneCallback, *mut c_void, c_int, *mut c_void, ...) -> c_int;
pub type OpenFn = unsafe extern "C" fn(*const c_char, c_int, ...) -> c_int;
pub type OpenAtFn = unsafe extern "C" fn(c_int, *const c_char, c_int, ...) -> c_int;
pub type CreatFn = unsafe extern "C" fn(*const c_char, mode_t) -> c_int;
/// `execv` and `execvp`.
pub type ExecvFn = unsafe extern "C" fn(*const c_char, *const *const c_char) -> c_int;
/// `execve` and `execvpe`.
pub type ExecveFn =
    unsafe extern "C" fn(*const c_char, *const *const c_char, *const *const c_char) -> c_int;

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

pub struct Resolver {
    slots: [AtomicPtr<c_void>; CallKind::COUNT],
    // Reentrant: `dlsym` may allocate, and an allocator that reads its own
    // environment lands back in the `getenv` interceptor on this thread.
    // Replaced only by `reset_in_child`.
    init: UnsafeCell<ReentrantMutex<()>>,
}

// SAFETY: outside `reset_in_child` the cell is only ever read.
unsafe impl Sync for Resolver {}

impl Resolver {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: [const { AtomicPtr::new(ptr::null_mut()) }; CallKind::COUNT],
            init: UnsafeCell::new(ReentrantMutex::new(())),
        }
    }

    /// Address of the next definition of `kind`'s symbol after this library.
    pub fn resolve(&self, kind: CallKind) -> Result<NonNull<c_void>, TraceError> {
        let slot = &self.slots[kind.index()];
        if let Some(found) = NonNull::new(slot.load(Ordering::Acquire)) {
            return Ok(found);
        }

        // SAFETY: see `unsafe impl Sync`.
        let _init = unsafe { &*self.init.get() }.lock();
        if let Some(found) = NonNull::new(slot.load(Ordering::Acquire)) {
            return Ok(found);
        }
        // SAFETY: `c_symbol` is a NUL-terminated static name.
        let raw = unsafe { libc::dlsym(libc::RTLD_NEXT, kind.c_symbol().as_ptr()) };
        let found = NonNull::new(raw).ok_or(TraceError::SymbolUnresolved { kind })?;
        slot.store(found.as_ptr(), Ordering::Release);
        Ok(found)
    }

    /// [`resolve`](Self::resolve), cast to a callable function pointer.
    ///
    /// # Safety
    ///
    /// `F` must be the function pointer type matching the C prototype of
    /// `kind`'s symbol (one of the aliases in this module).
    pub unsafe fn original<F: Copy>(&self, kind: CallKind) -> Result<F, TraceError> {
        const {
            assert!(size_of::<F>() == size_of::<*mut c_void>());
        }
        let found = self.resolve(kind)?;
        // SAFETY: same size checked above; the caller vouches for the type.
        Ok(unsafe { std::mem::transmute_copy::<NonNull<c_void>, F>(&found) })
    }

    /// Forget whatever state the init lock had when the process forked.
    ///
    /// A thread of the parent may have been resolving a symbol at the time;
    /// in the child that thread is gone and would hold the lock forever.
    /// Published slots stay valid.
    ///
    /// # Safety
    ///
    /// No other thread may be using the resolver while the call runs. In a
    /// fork child the caller is the only thread.
    pub unsafe fn reset_in_child(&self) {
        // SAFETY: nothing else observes the cell, per the contract above.
        unsafe { ptr::write(self.init.get(), ReentrantMutex::new(())) };
    }

    #[must_use]
    pub fn is_resolved(&self, kind: CallKind) -> bool {
        !self.slots[kind.index()].load(Ordering::Acquire).is_null()
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}
