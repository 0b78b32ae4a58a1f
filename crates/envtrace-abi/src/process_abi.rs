//! ABI layer for process creation and program replacement.
//!
//! * `fork`: the parent records the child's pid (or the failure); the child
//!   records nothing for the fork itself.
//! * `clone`: forwards the optional trailing arguments the flags call for.
//! * `exec*`: a record exists only when the original returns, i.e. failed.
//!   The list forms gather their variadic arguments into a NULL-terminated
//!   vector and delegate to the matching vector form.

use std::ffi::{c_char, c_int, c_void};
use std::ptr;

use envtrace_core::arglist::collect_arg_list;
use envtrace_core::config::MAX_LIST_ARGS;
use envtrace_core::record::CallDetail;
use envtrace_core::{CallKind, TraceError};
use libc::pid_t;

use crate::errno_abi;
use crate::resolver::{CloneCallback, CloneFn, ExecveFn, ExecvFn, ForkFn};
use crate::tracer::{Tracer, tracer};
use crate::util::c_bytes;

/// Argument vector gathered from a list-form `exec` call.
pub type ArgList = Result<Vec<*const c_char>, TraceError>;

// ---------------------------------------------------------------------------
// fork
// ---------------------------------------------------------------------------

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn fork() -> pid_t {
    unsafe { traced_fork(tracer()) }
}

pub unsafe fn traced_fork(t: &Tracer) -> pid_t {
    let real: ForkFn = unsafe { t.prepare(CallKind::Fork) };
    // Held across the fork so the child never inherits a half-written record.
    let order = t.exclusive();
    let pid = unsafe { real() };
    if pid == 0 {
        // SAFETY: the child's only thread, right after the fork.
        unsafe { t.reset_in_child(order) };
        return 0;
    }
    t.emit(CallDetail::Fork { child: pid });
    pid
}

// ---------------------------------------------------------------------------
// clone
// ---------------------------------------------------------------------------

/// How many of `parent_tid`, `tls`, `child_tid` the caller passed, judging
/// by `flags`.
#[must_use]
pub fn clone_trailing_args(flags: c_int) -> usize {
    if flags & (libc::CLONE_CHILD_SETTID | libc::CLONE_CHILD_CLEARTID) != 0 {
        3
    } else if flags & libc::CLONE_SETTLS != 0 {
        2
    } else if flags & (libc::CLONE_PARENT_SETTID | libc::CLONE_PIDFD) != 0 {
        1
    } else {
        0
    }
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn clone(
    callback: CloneCallback,
    stack: *mut c_void,
    flags: c_int,
    arg: *mut c_void,
    mut args: ...
) -> c_int {
    let mut trailing = [ptr::null_mut::<c_void>(); 3];
    for slot in trailing.iter_mut().take(clone_trailing_args(flags)) {
        *slot = unsafe { args.next_arg::<*mut c_void>() };
    }
    unsafe { traced_clone(tracer(), callback, stack, flags, arg, trailing) }
}

pub unsafe fn traced_clone(
    t: &Tracer,
    callback: CloneCallback,
    stack: *mut c_void,
    flags: c_int,
    arg: *mut c_void,
    trailing: [*mut c_void; 3],
) -> c_int {
    let real: CloneFn = unsafe { t.prepare(CallKind::Clone) };
    let [parent_tid, tls, child_tid] = trailing;
    let rc = unsafe { real(callback, stack, flags, arg, parent_tid, tls, child_tid) };
    t.emit(CallDetail::Clone { result: rc });
    rc
}

// ---------------------------------------------------------------------------
// exec, vector forms
// ---------------------------------------------------------------------------

fn record_exec(t: &Tracer, kind: CallKind, path: *const c_char, rc: c_int) -> c_int {
    t.emit(CallDetail::Exec {
        kind,
        path: unsafe { c_bytes(path) },
        result: rc,
    });
    rc
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn execv(path: *const c_char, argv: *const *const c_char) -> c_int {
    unsafe { traced_execv(tracer(), CallKind::Execv, path, argv) }
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn execvp(file: *const c_char, argv: *const *const c_char) -> c_int {
    unsafe { traced_execv(tracer(), CallKind::Execvp, file, argv) }
}

/// `execv` or `execvp`, selected by `kind`.
pub unsafe fn traced_execv(
    t: &Tracer,
    kind: CallKind,
    path: *const c_char,
    argv: *const *const c_char,
) -> c_int {
    let real: ExecvFn = unsafe { t.prepare(kind) };
    let rc = unsafe { real(path, argv) };
    record_exec(t, kind, path, rc)
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn execve(
    path: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
) -> c_int {
    unsafe { traced_execve(tracer(), CallKind::Execve, path, argv, envp) }
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn execvpe(
    file: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
) -> c_int {
    unsafe { traced_execve(tracer(), CallKind::Execvpe, file, argv, envp) }
}

/// `execve` or `execvpe`, selected by `kind`.
pub unsafe fn traced_execve(
    t: &Tracer,
    kind: CallKind,
    path: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
) -> c_int {
    let real: ExecveFn = unsafe { t.prepare(kind) };
    let rc = unsafe { real(path, argv, envp) };
    record_exec(t, kind, path, rc)
}

// ---------------------------------------------------------------------------
// exec, list forms
// ---------------------------------------------------------------------------

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn execl(path: *const c_char, arg0: *const c_char, mut args: ...) -> c_int {
    let argv = collect_arg_list(arg0, || unsafe { args.next_arg::<*const c_char>() }, MAX_LIST_ARGS);
    unsafe { traced_execl(tracer(), CallKind::Execl, path, argv) }
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn execlp(file: *const c_char, arg0: *const c_char, mut args: ...) -> c_int {
    let argv = collect_arg_list(arg0, || unsafe { args.next_arg::<*const c_char>() }, MAX_LIST_ARGS);
    unsafe { traced_execl(tracer(), CallKind::Execlp, file, argv) }
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn execle(path: *const c_char, arg0: *const c_char, mut args: ...) -> c_int {
    let argv = collect_arg_list(arg0, || unsafe { args.next_arg::<*const c_char>() }, MAX_LIST_ARGS);
    // The environment follows the terminating NULL; past an overlong list
    // its position is unknown.
    let envp = match argv {
        Ok(_) => unsafe { args.next_arg::<*const *const c_char>() },
        Err(_) => ptr::null(),
    };
    unsafe { traced_execle(tracer(), path, argv, envp) }
}

/// `execl` or `execlp`, selected by `kind`, with the list already gathered.
pub unsafe fn traced_execl(t: &Tracer, kind: CallKind, path: *const c_char, argv: ArgList) -> c_int {
    let vector = kind.vector_form().unwrap_or(kind);
    let real: ExecvFn = unsafe { t.prepare(vector) };
    let rc = match argv {
        Ok(argv) => unsafe { real(path, argv.as_ptr()) },
        Err(_) => too_many_args(),
    };
    record_exec(t, kind, path, rc)
}

/// `execle` with the list and environment already gathered.
pub unsafe fn traced_execle(
    t: &Tracer,
    path: *const c_char,
    argv: ArgList,
    envp: *const *const c_char,
) -> c_int {
    let real: ExecveFn = unsafe { t.prepare(CallKind::Execve) };
    let rc = match argv {
        Ok(argv) => unsafe { real(path, argv.as_ptr(), envp) },
        Err(_) => too_many_args(),
    };
    record_exec(t, CallKind::Execle, path, rc)
}

fn too_many_args() -> c_int {
    errno_abi::set_errno(libc::E2BIG);
    -1
}

#[cfg(test)]
mod tests {
    use super::*;
    use envtrace_core::record::ParsedRecord;
    use std::path::Path;

    fn records(path: &Path) -> Vec<ParsedRecord> {
        std::fs::read(path)
            .unwrap_or_default()
            .split_inclusive(|&b| b == b'\n')
            .map(|l| ParsedRecord::parse(l).unwrap())
            .collect()
    }

    fn argv(items: &[&'static std::ffi::CStr]) -> Vec<*const c_char> {
        items
            .iter()
            .map(|s| s.as_ptr())
            .chain(std::iter::once(ptr::null()))
            .collect()
    }

    #[test]
    fn clone_argument_counts() {
        assert_eq!(clone_trailing_args(libc::SIGCHLD), 0);
        assert_eq!(clone_trailing_args(libc::CLONE_VM | libc::CLONE_PARENT_SETTID), 1);
        assert_eq!(clone_trailing_args(libc::CLONE_PIDFD), 1);
        assert_eq!(clone_trailing_args(libc::CLONE_SETTLS), 2);
        assert_eq!(
            clone_trailing_args(libc::CLONE_PARENT_SETTID | libc::CLONE_CHILD_CLEARTID),
            3
        );
        assert_eq!(clone_trailing_args(libc::CLONE_CHILD_SETTID), 3);
    }

    #[test]
    fn failed_vector_execs_are_recorded_with_errno() {
        let _guard = crate::TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("trace.log");
        let t = Tracer::with_log_path(&log);
        let missing = c"/nonexistent/envtrace/prog";
        let args = argv(&[c"prog"]);
        let env = argv(&[c"A=1"]);

        unsafe {
            errno_abi::set_errno(0);
            assert_eq!(traced_execv(&t, CallKind::Execv, missing.as_ptr(), args.as_ptr()), -1);
            assert_eq!(errno_abi::errno(), libc::ENOENT);
            assert_eq!(
                traced_execve(&t, CallKind::Execve, missing.as_ptr(), args.as_ptr(), env.as_ptr()),
                -1
            );
            assert_eq!(errno_abi::errno(), libc::ENOENT);
            assert_eq!(
                traced_execv(&t, CallKind::Execvp, c"envtrace-no-such-cmd".as_ptr(), args.as_ptr()),
                -1
            );
            assert_eq!(
                traced_execve(
                    &t,
                    CallKind::Execvpe,
                    c"envtrace-no-such-cmd".as_ptr(),
                    args.as_ptr(),
                    env.as_ptr()
                ),
                -1
            );
        }

        let recs = records(&log);
        let kinds: Vec<CallKind> = recs.iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            [CallKind::Execv, CallKind::Execve, CallKind::Execvp, CallKind::Execvpe]
        );
        assert_eq!(recs[0].field_str(0), Some("/nonexistent/envtrace/prog"));
        assert_eq!(recs[2].field_str(0), Some("envtrace-no-such-cmd"));
        assert!(recs.iter().all(|r| r.result() == Some(-1)));
    }

    #[test]
    fn list_forms_log_their_own_kind() {
        let _guard = crate::TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("trace.log");
        let t = Tracer::with_log_path(&log);
        let missing = c"/nonexistent/envtrace/prog";

        unsafe {
            traced_execl(&t, CallKind::Execl, missing.as_ptr(), Ok(argv(&[c"prog", c"-x"])));
            traced_execl(&t, CallKind::Execlp, c"envtrace-no-such-cmd".as_ptr(), Ok(argv(&[])));
            let env = argv(&[c"A=1"]);
            errno_abi::set_errno(0);
            let rc = traced_execle(&t, missing.as_ptr(), Ok(argv(&[c"prog"])), env.as_ptr());
            assert_eq!(rc, -1);
            assert_eq!(errno_abi::errno(), libc::ENOENT);
        }

        let kinds: Vec<CallKind> = records(&log).iter().map(|r| r.kind).collect();
        assert_eq!(kinds, [CallKind::Execl, CallKind::Execlp, CallKind::Execle]);
    }

    #[test]
    fn overlong_list_fails_with_e2big() {
        let _guard = crate::TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("trace.log");
        let t = Tracer::with_log_path(&log);

        errno_abi::set_errno(0);
        let rc = unsafe {
            traced_execl(
                &t,
                CallKind::Execl,
                c"/bin/true".as_ptr(),
                Err(TraceError::TooManyArgs { limit: 1 }),
            )
        };
        assert_eq!(rc, -1);
        assert_eq!(errno_abi::errno(), libc::E2BIG);

        let recs = records(&log);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].kind, CallKind::Execl);
        assert_eq!(recs[0].result(), Some(-1));
    }

    #[test]
    fn fork_parent_records_child_pid() {
        let _guard = crate::TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("trace.log");
        let t = Tracer::with_log_path(&log);

        let pid = unsafe { traced_fork(&t) };
        if pid == 0 {
            unsafe { libc::_exit(0) };
        }
        assert!(pid > 0);
        let mut status = 0;
        assert_eq!(unsafe { libc::waitpid(pid, &mut status, 0) }, pid);

        let recs = records(&log);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].kind, CallKind::Fork);
        assert_eq!(recs[0].pid, std::process::id() as i32);
        assert_eq!(recs[0].result(), Some(pid as i64));
    }

    #[test]
    fn forked_children_log_while_other_threads_hold_the_lock() {
        use crate::env_abi::traced_getenv;
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::time::{Duration, Instant};

        const FORKS: usize = 20;

        let _guard = crate::TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("trace.log");
        let t = Tracer::with_log_path(&log);
        let stop = AtomicBool::new(false);

        let mut children = Vec::new();
        let mut hung = 0;
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    while !stop.load(Ordering::Relaxed) {
                        unsafe { traced_getenv(&t, c"ENVTRACE_SPIN".as_ptr()) };
                    }
                });
            }
            for _ in 0..FORKS {
                let pid = unsafe { traced_fork(&t) };
                if pid == 0 {
                    unsafe {
                        traced_getenv(&t, c"ENVTRACE_FORKED_CHILD".as_ptr());
                        libc::_exit(0);
                    }
                }
                assert!(pid > 0);
                let deadline = Instant::now() + Duration::from_secs(10);
                let mut status = 0;
                while unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) } == 0 {
                    if Instant::now() > deadline {
                        unsafe {
                            libc::kill(pid, libc::SIGKILL);
                            libc::waitpid(pid, &mut status, 0);
                        }
                        hung += 1;
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                children.push(pid);
            }
            stop.store(true, Ordering::Relaxed);
        });
        assert_eq!(hung, 0);

        let logged: Vec<i32> = records(&log)
            .iter()
            .filter(|r| r.field_str(0) == Some("ENVTRACE_FORKED_CHILD"))
            .map(|r| r.pid)
            .collect();
        assert_eq!(logged.len(), FORKS);
        assert!(children.iter().all(|pid| logged.contains(pid)));
    }

    #[test]
    fn clone_with_sigchld_behaves_like_fork() {
        extern "C" fn child(_: *mut c_void) -> c_int {
            0
        }

        let _guard = crate::TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("trace.log");
        let t = Tracer::with_log_path(&log);

        let mut stack = vec![0u8; 64 * 1024];
        let top = unsafe { stack.as_mut_ptr().add(stack.len()) }.cast::<c_void>();
        let pid = unsafe {
            traced_clone(
                &t,
                Some(child),
                top,
                libc::SIGCHLD,
                ptr::null_mut(),
                [ptr::null_mut(); 3],
            )
        };
        assert!(pid > 0);
        let mut status = 0;
        assert_eq!(unsafe { libc::waitpid(pid, &mut status, 0) }, pid);
        assert!(libc::WIFEXITED(status));
        assert_eq!(libc::WEXITSTATUS(status), 0);

        let recs = records(&log);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].kind, CallKind::Clone);
        assert_eq!(recs[0].result(), Some(pid as i64));
    }
}
