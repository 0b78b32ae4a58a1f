//! ABI layer for the file-opening functions (`open`, `openat`, `creat`).
//!
//! `open` and `openat` are variadic: the mode argument exists only when the
//! flags ask for a file to be created, and is read and forwarded only then.
//! The `*64` variants are not intercepted.

use std::ffi::{c_char, c_int};

use envtrace_core::CallKind;
use envtrace_core::record::CallDetail;
use libc::mode_t;

use crate::resolver::{CreatFn, OpenAtFn, OpenFn};
use crate::tracer::{Tracer, tracer};
use crate::util::c_bytes;

/// Whether `flags` make `open`/`openat` consume a mode argument.
#[must_use]
pub fn open_needs_mode(flags: c_int) -> bool {
    flags & libc::O_CREAT != 0 || flags & libc::O_TMPFILE == libc::O_TMPFILE
}

// ---------------------------------------------------------------------------
// open
// ---------------------------------------------------------------------------

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn open(path: *const c_char, flags: c_int, mut args: ...) -> c_int {
    let mode = open_needs_mode(flags).then(|| unsafe { args.next_arg::<mode_t>() });
    unsafe { traced_open(tracer(), path, flags, mode) }
}

pub unsafe fn traced_open(
    t: &Tracer,
    path: *const c_char,
    flags: c_int,
    mode: Option<mode_t>,
) -> c_int {
    let real: OpenFn = unsafe { t.prepare(CallKind::Open) };
    let fd = match mode {
        Some(mode) => unsafe { real(path, flags, mode) },
        None => unsafe { real(path, flags) },
    };
    t.emit(CallDetail::Open {
        path: unsafe { c_bytes(path) },
        fd,
    });
    fd
}

// ---------------------------------------------------------------------------
// openat
// ---------------------------------------------------------------------------

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn openat(
    dirfd: c_int,
    path: *const c_char,
    flags: c_int,
    mut args: ...
) -> c_int {
    let mode = open_needs_mode(flags).then(|| unsafe { args.next_arg::<mode_t>() });
    unsafe { traced_openat(tracer(), dirfd, path, flags, mode) }
}

pub unsafe fn traced_openat(
    t: &Tracer,
    dirfd: c_int,
    path: *const c_char,
    flags: c_int,
    mode: Option<mode_t>,
) -> c_int {
    let real: OpenAtFn = unsafe { t.prepare(CallKind::OpenAt) };
    let fd = match mode {
        Some(mode) => unsafe { real(dirfd, path, flags, mode) },
        None => unsafe { real(dirfd, path, flags) },
    };
    t.emit(CallDetail::OpenAt {
        dirfd,
        path: unsafe { c_bytes(path) },
        fd,
    });
    fd
}

// ---------------------------------------------------------------------------
// creat
// ---------------------------------------------------------------------------

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn creat(path: *const c_char, mode: mode_t) -> c_int {
    unsafe { traced_creat(tracer(), path, mode) }
}

pub unsafe fn traced_creat(t: &Tracer, path: *const c_char, mode: mode_t) -> c_int {
    let real: CreatFn = unsafe { t.prepare(CallKind::Creat) };
    let fd = unsafe { real(path, mode) };
    t.emit(CallDetail::Creat {
        path: unsafe { c_bytes(path) },
        fd,
    });
    fd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errno_abi;
    use envtrace_core::record::ParsedRecord;
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt as _;
    use std::os::unix::fs::PermissionsExt as _;
    use std::path::Path;

    fn records(path: &Path) -> Vec<ParsedRecord> {
        std::fs::read(path)
            .unwrap()
            .split_inclusive(|&b| b == b'\n')
            .map(|l| ParsedRecord::parse(l).unwrap())
            .collect()
    }

    fn c_path(p: &Path) -> CString {
        CString::new(p.as_os_str().as_bytes()).unwrap()
    }

    #[test]
    fn mode_only_with_create_flags() {
        assert!(!open_needs_mode(libc::O_RDONLY));
        assert!(!open_needs_mode(libc::O_WRONLY | libc::O_TRUNC));
        assert!(!open_needs_mode(libc::O_DIRECTORY));
        assert!(open_needs_mode(libc::O_CREAT));
        assert!(open_needs_mode(libc::O_WRONLY | libc::O_CREAT | libc::O_EXCL));
        assert!(open_needs_mode(libc::O_TMPFILE | libc::O_RDWR));
    }

    #[test]
    fn open_existing_and_missing() {
        let _guard = crate::TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("trace.log");
        let target = dir.path().join("data.txt");
        std::fs::write(&target, b"hi").unwrap();
        let missing = dir.path().join("missing.txt");
        let t = Tracer::with_log_path(&log);

        let fd = unsafe { traced_open(&t, c_path(&target).as_ptr(), libc::O_RDONLY, None) };
        assert!(fd >= 0);
        unsafe { libc::close(fd) };

        errno_abi::set_errno(0);
        let bad = unsafe { traced_open(&t, c_path(&missing).as_ptr(), libc::O_RDONLY, None) };
        assert_eq!(bad, -1);
        assert_eq!(errno_abi::errno(), libc::ENOENT);

        let recs = records(&log);
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].kind, CallKind::Open);
        assert_eq!(recs[0].fields[0].as_deref(), Some(target.as_os_str().as_bytes()));
        assert_eq!(recs[0].result(), Some(fd as i64));
        assert_eq!(recs[1].result(), Some(-1));
    }

    #[test]
    fn create_forwards_mode() {
        let _guard = crate::TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("trace.log");
        let target = dir.path().join("made.txt");
        let t = Tracer::with_log_path(&log);

        let old = unsafe { libc::umask(0) };
        let fd = unsafe {
            traced_open(
                &t,
                c_path(&target).as_ptr(),
                libc::O_WRONLY | libc::O_CREAT | libc::O_EXCL,
                Some(0o640),
            )
        };
        unsafe { libc::umask(old) };
        assert!(fd >= 0);
        unsafe { libc::close(fd) };

        let mode = std::fs::metadata(&target).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o640);
        assert_eq!(records(&log)[0].result(), Some(fd as i64));
    }

    #[test]
    fn openat_records_dirfd() {
        let _guard = crate::TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("trace.log");
        std::fs::write(dir.path().join("rel.txt"), b"").unwrap();
        let t = Tracer::with_log_path(&log);

        let dirfd = unsafe { libc::open(c_path(dir.path()).as_ptr(), libc::O_RDONLY | libc::O_DIRECTORY) };
        assert!(dirfd >= 0);
        let fd = unsafe { traced_openat(&t, dirfd, c"rel.txt".as_ptr(), libc::O_RDONLY, None) };
        assert!(fd >= 0);

        errno_abi::set_errno(0);
        let bad = unsafe { traced_openat(&t, -1, c"rel.txt".as_ptr(), libc::O_RDONLY, None) };
        assert_eq!(bad, -1);
        assert_eq!(errno_abi::errno(), libc::EBADF);
        unsafe {
            libc::close(fd);
            libc::close(dirfd);
        }

        let recs = records(&log);
        assert_eq!(recs[0].kind, CallKind::OpenAt);
        assert_eq!(recs[0].field_str(0), Some(dirfd.to_string().as_str()));
        assert_eq!(recs[0].field_str(1), Some("rel.txt"));
        assert_eq!(recs[0].result(), Some(fd as i64));
        assert_eq!(recs[1].field_str(0), Some("-1"));
        assert_eq!(recs[1].result(), Some(-1));
    }

    #[test]
    fn creat_truncates_and_logs() {
        let _guard = crate::TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("trace.log");
        let target = dir.path().join("out.o");
        std::fs::write(&target, b"stale").unwrap();
        let t = Tracer::with_log_path(&log);

        let fd = unsafe { traced_creat(&t, c_path(&target).as_ptr(), 0o600) };
        assert!(fd >= 0);
        unsafe { libc::close(fd) };
        assert_eq!(std::fs::metadata(&target).unwrap().len(), 0);

        let recs = records(&log);
        assert_eq!(recs[0].kind, CallKind::Creat);
        assert_eq!(recs[0].result(), Some(fd as i64));
    }
}
