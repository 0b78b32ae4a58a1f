//! Process-wide tracing context shared by every interceptor.
//!
//! An interceptor runs four steps:
//!
//! 1. [`Tracer::prepare`]: resolve the original and open the log, or die.
//! 2. Optionally take [`Tracer::exclusive`] when the record must describe the
//!    state the call observed (environment reads and writes, `fork`).
//! 3. Call the original with the caller's exact arguments.
//! 4. [`Tracer::emit`] the record and return the original result.
//!
//! `emit` leaves `errno` exactly as it found it.

use std::ffi::{CStr, c_char};

use envtrace_core::config::{LOG_PATH_VAR, USER_VAR};
use envtrace_core::record::{CallDetail, EventHeader, EventRecord, Identity, Timestamp};
use envtrace_core::{CallKind, TraceError};

use crate::errno_abi;
use crate::resolver::{GetenvFn, Resolver};
use crate::sink::{LogSink, SinkGuard};
use crate::util::{c_bytes, diagnostic};

unsafe extern "C" {
    /// `argv[0]` as the process was invoked (glibc).
    static program_invocation_name: *const c_char;
}

pub struct Tracer {
    resolver: Resolver,
    sink: LogSink,
}

static TRACER: Tracer = Tracer::new();

/// The tracer behind the exported symbols.
#[inline]
pub fn tracer() -> &'static Tracer {
    &TRACER
}

impl Tracer {
    /// Tracer logging to the path named by `ENVTRACE_LOGFILE`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            resolver: Resolver::new(),
            sink: LogSink::from_env(LOG_PATH_VAR),
        }
    }

    /// Tracer logging to a fixed path, independent of the environment.
    #[must_use]
    pub fn with_log_path(path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            resolver: Resolver::new(),
            sink: LogSink::at_path(path),
        }
    }

    pub fn sink(&self) -> &LogSink {
        &self.sink
    }

    /// Original implementation of `kind`, terminating the process if the
    /// dynamic linker has none.
    ///
    /// # Safety
    ///
    /// `F` must match the C prototype of `kind`'s symbol.
    pub unsafe fn original<F: Copy>(&self, kind: CallKind) -> F {
        match unsafe { self.resolver.original::<F>(kind) } {
            Ok(f) => f,
            Err(err) => fatal(&err),
        }
    }

    /// Resolve `kind`'s original and make sure the log is open.
    ///
    /// # Safety
    ///
    /// As for [`original`](Self::original).
    pub unsafe fn prepare<F: Copy>(&self, kind: CallKind) -> F {
        let f = unsafe { self.original::<F>(kind) };
        if let Err(err) = self.open_sink() {
            fatal(&err);
        }
        f
    }

    fn open_sink(&self) -> Result<(), TraceError> {
        let getenv: GetenvFn = unsafe { self.resolver.original(CallKind::Getenv)? };
        self.sink
            .ensure_open(|var| unsafe { c_bytes(getenv(var.as_ptr())) }.map(<[u8]>::to_vec))
    }

    /// Copy of an environment value read through the original `getenv`.
    pub fn real_getenv(&self, name: &CStr) -> Option<Vec<u8>> {
        let getenv: GetenvFn = unsafe { self.original(CallKind::Getenv) };
        let value = unsafe { c_bytes(getenv(name.as_ptr())) };
        value.map(<[u8]>::to_vec)
    }

    /// [`real_getenv`](Self::real_getenv) for a raw, possibly NULL name.
    ///
    /// # Safety
    ///
    /// A non-null `name` must point to a NUL-terminated string.
    pub unsafe fn prior_value(&self, name: *const c_char) -> Option<Vec<u8>> {
        if name.is_null() {
            return None;
        }
        self.real_getenv(unsafe { CStr::from_ptr(name) })
    }

    /// Hold off every other thread's records until the guard drops.
    pub fn exclusive(&self) -> SinkGuard<'_> {
        self.sink.lock()
    }

    /// Drop every lock the parent's threads could have held at the moment of
    /// the fork, including the caller's `order`, so the child can log.
    ///
    /// # Safety
    ///
    /// Only in the child of `fork`, before it calls any other interceptor,
    /// with `order` taken from [`exclusive`](Self::exclusive) before the fork.
    pub unsafe fn reset_in_child(&self, order: SinkGuard<'_>) {
        unsafe {
            self.sink.reset_in_child(order);
            self.resolver.reset_in_child();
        }
    }

    /// Append the record for one completed call.
    ///
    /// A failed write is reported on stderr and otherwise ignored.
    pub fn emit(&self, detail: CallDetail<'_>) {
        let saved = errno_abi::errno();
        {
            let _order = self.sink.lock();
            let user = self.real_getenv(USER_VAR);
            let host = hostname();
            let record = EventRecord {
                header: EventHeader {
                    identity: Some(Identity {
                        user: user.as_deref(),
                        host: &host,
                    }),
                    timestamp: Timestamp::now(),
                    // SAFETY: neither call can fail.
                    ppid: unsafe { libc::getppid() },
                    pid: unsafe { libc::getpid() },
                    program: program_name(),
                },
                detail,
            };
            if let Err(err) = self.sink.write_record(&record.to_line()) {
                diagnostic(format_args!("couldn't write {} record: {err}", record.kind()));
            }
        }
        errno_abi::set_errno(saved);
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new()
    }
}

/// Report `err` on stderr and terminate without running exit handlers.
pub fn fatal(err: &TraceError) -> ! {
    diagnostic(format_args!("{err}"));
    // SAFETY: `_exit` never returns and touches no process state we own.
    unsafe { libc::_exit(err.exit_code().unwrap_or(1)) }
}

fn program_name() -> &'static [u8] {
    // SAFETY: glibc initializes the pointer before any constructor or user
    // code runs and keeps the string alive for the life of the process.
    let name = unsafe { c_bytes(program_invocation_name) };
    name.unwrap_or_default()
}

fn hostname() -> Vec<u8> {
    let mut buf = [0u8; 256];
    // SAFETY: `buf` is writable for its full length.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return Vec::new();
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    buf[..len].to_vec()
}
