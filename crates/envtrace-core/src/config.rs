//! Configuration constants.
//!
//! The shim has exactly one configuration input: the environment variable
//! naming the log destination. Everything else here is fixed at build time.

use std::ffi::CStr;

/// Environment variable naming the append-only log destination.
pub const LOG_PATH_VAR: &CStr = c"ENVTRACE_LOGFILE";

/// Environment variable read for the acting user in the identity prefix.
pub const USER_VAR: &CStr = c"USER";

/// Prefix of every diagnostic line written to the error stream.
pub const DIAGNOSTIC_PREFIX: &str = "envtrace";

/// Upper bound on the number of arguments accepted by the list-form `exec`
/// calls.
///
/// Each argument costs at least a pointer and a NUL byte against
/// [`EXEC_AREA_CEILING`], so no longer list can be executed.
pub const MAX_LIST_ARGS: usize = 1 << 20;

/// Largest argument and environment area Linux accepts for `execve`,
/// whatever the stack limit.
pub const EXEC_AREA_CEILING: usize = 6 << 20;

/// Exit status when the log destination variable is not set (`EX_CONFIG`).
pub const EXIT_LOG_PATH_UNSET: i32 = 78;

/// Exit status when the log destination cannot be opened (`EX_CANTCREAT`).
pub const EXIT_LOG_OPEN: i32 = 73;

/// Exit status when an original symbol cannot be resolved (`EX_SOFTWARE`).
pub const EXIT_SYMBOL_UNRESOLVED: i32 = 70;

/// Mode used when the log destination has to be created (before umask).
pub const LOG_FILE_MODE: u32 = 0o666;
