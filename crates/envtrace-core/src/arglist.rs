//! Bounded reconstruction of list-form `exec` arguments.
//!
//! `execl`, `execle` and `execlp` receive their arguments as a variable-length
//! list closed by a NULL pointer. The ABI layer pulls them one at a time; this
//! module decides when to stop and materializes them into an owned vector
//! that the vector-form call can consume.

use crate::error::TraceError;

/// Collect `first` and the pointers yielded by `next` up to and including the
/// terminating NULL.
///
/// At most `limit` non-NULL arguments are accepted. At most one argument past
/// the bound is read: if it is not NULL the call fails with
/// [`TraceError::TooManyArgs`]. When `first` is itself NULL nothing further is
/// requested: the list is empty and the result is `[NULL]`.
pub fn collect_arg_list<T, F>(
    first: *const T,
    mut next: F,
    limit: usize,
) -> Result<Vec<*const T>, TraceError>
where
    F: FnMut() -> *const T,
{
    let mut argv = Vec::with_capacity(8);
    if first.is_null() {
        argv.push(first);
        return Ok(argv);
    }
    if limit == 0 {
        return Err(TraceError::TooManyArgs { limit });
    }
    argv.push(first);

    loop {
        let arg = next();
        if arg.is_null() {
            argv.push(arg);
            return Ok(argv);
        }
        if argv.len() == limit {
            return Err(TraceError::TooManyArgs { limit });
        }
        argv.push(arg);
    }
}
