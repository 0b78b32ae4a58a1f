#![feature(c_variadic)]
// Every exported entry point takes raw pointers straight from C callers and
// forwards them untouched; per-function safety docs would only repeat that.
#![allow(clippy::missing_safety_doc)]
//! # envtrace-abi
//!
//! Audit shim loaded ahead of libc with `LD_PRELOAD`.
//!
//! This crate produces a `cdylib` exporting `getenv`, `setenv`, `unsetenv`,
//! `fork`, `clone`, `open`, `openat`, `creat` and the seven `exec` functions.
//! Each export resolves the next definition of its symbol in the dynamic
//! linker's search order, calls it with the caller's exact arguments, appends
//! one record to the file named by `ENVTRACE_LOGFILE`, and hands the original
//! return value and `errno` back.
//!
//! # Architecture
//!
//! ```text
//! C caller -> export (this crate) -> Tracer::prepare (resolver + sink)
//!          -> original libc symbol -> Tracer::emit -> return
//! ```
//!
//! Every build of the library exports the intercepted symbols. Only this
//! crate's own unit-test harness leaves them mangled, since a test binary that
//! defines `getenv` would trace itself. Integration tests never link the
//! library; they drive the `envtrace-fixture` binary with the built `cdylib`
//! under `LD_PRELOAD`.

pub mod env_abi;
pub mod errno_abi;
pub mod io_abi;
pub mod process_abi;
pub mod resolver;
pub mod sink;
pub mod tracer;

mod util;

#[cfg(test)]
pub(crate) static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
