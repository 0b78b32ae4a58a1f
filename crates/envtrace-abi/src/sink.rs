//! The append-only log destination.
//!
//! One `LogSink` per process. It is opened on first use and never closed;
//! every record is written with a single `write(2)` on an `O_APPEND`
//! descriptor, so lines from concurrent processes sharing the file never
//! interleave. The same lock that guards the descriptor also orders records
//! within the process (see [`LogSink::lock`]).

use std::cell::{RefCell, UnsafeCell};
use std::ffi::{CStr, OsString};
use std::fs::{File, OpenOptions};
use std::io::{self, Write as _};
use std::os::unix::ffi::OsStringExt as _;
use std::os::unix::fs::OpenOptionsExt as _;
use std::path::PathBuf;
use std::{mem, ptr};

use envtrace_core::TraceError;
use envtrace_core::config::LOG_FILE_MODE;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

/// Where the destination path comes from.
enum Destination {
    /// Read from this environment variable at first use.
    Env(&'static CStr),
    Path(PathBuf),
}

type Stream = ReentrantMutex<RefCell<Option<File>>>;

pub type SinkGuard<'a> = ReentrantMutexGuard<'a, RefCell<Option<File>>>;

pub struct LogSink {
    destination: Destination,
    // Replaced only by `reset_in_child`.
    stream: UnsafeCell<Stream>,
}

// SAFETY: outside `reset_in_child` the cell is only ever read, and the
// mutex inside it is `Sync` because `File` is `Send`.
unsafe impl Sync for LogSink {}

impl LogSink {
    /// Sink whose path is the value of `var` when first opened.
    #[must_use]
    pub const fn from_env(var: &'static CStr) -> Self {
        Self {
            destination: Destination::Env(var),
            stream: UnsafeCell::new(ReentrantMutex::new(RefCell::new(None))),
        }
    }

    /// Sink with a fixed path.
    #[must_use]
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self {
            destination: Destination::Path(path.into()),
            stream: UnsafeCell::new(ReentrantMutex::new(RefCell::new(None))),
        }
    }

    /// Take the ordering lock.
    ///
    /// Reentrant, so an interceptor that holds it across its original call
    /// can still emit from the same thread.
    pub fn lock(&self) -> SinkGuard<'_> {
        self.stream().lock()
    }

    fn stream(&self) -> &Stream {
        // SAFETY: see `unsafe impl Sync`.
        unsafe { &*self.stream.get() }
    }

    /// Give up `held` in a freshly forked child and start over with an
    /// unlocked lock around the same descriptor.
    ///
    /// Threads of the parent may have been parked on the lock at the time of
    /// the fork. Releasing it normally would try to wake them, and they do not
    /// exist in the child.
    ///
    /// # Safety
    ///
    /// `held` must be this sink's guard taken by the calling thread, and no
    /// other thread may be using the sink while the call runs. In a fork
    /// child the caller is the only thread.
    pub unsafe fn reset_in_child(&self, held: SinkGuard<'_>) {
        mem::forget(held);
        let cell = self.stream.get();
        // SAFETY: nothing else observes the cell, per the contract above.
        unsafe {
            let stale = ptr::read(cell);
            ptr::write(cell, ReentrantMutex::new(stale.into_inner()));
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.stream()
            .lock()
            .try_borrow()
            .is_ok_and(|slot| slot.is_some())
    }

    /// Open the destination unless already open.
    ///
    /// `lookup` reads an environment variable without going through any
    /// interceptor. An unset or empty variable is [`TraceError::LogPathUnset`].
    pub fn ensure_open(
        &self,
        lookup: impl FnOnce(&CStr) -> Option<Vec<u8>>,
    ) -> Result<(), TraceError> {
        let guard = self.stream().lock();
        if guard.try_borrow().is_ok_and(|slot| slot.is_some()) {
            return Ok(());
        }

        let path = match &self.destination {
            Destination::Path(path) => path.clone(),
            Destination::Env(var) => {
                let var: &'static CStr = *var;
                let raw = lookup(var)
                    .filter(|v| !v.is_empty())
                    .ok_or_else(|| TraceError::LogPathUnset {
                        var: var.to_str().unwrap_or("log destination"),
                    })?;
                PathBuf::from(OsString::from_vec(raw))
            }
        };

        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .mode(LOG_FILE_MODE)
            .open(&path)
            .map_err(|source| TraceError::LogOpen {
                path: path.display().to_string(),
                source,
            })?;

        match guard.try_borrow_mut() {
            Ok(mut slot) => {
                slot.get_or_insert(file);
                Ok(())
            }
            Err(_) => Err(TraceError::LogOpen {
                path: path.display().to_string(),
                source: io::Error::from(io::ErrorKind::ResourceBusy),
            }),
        }
    }

    /// Append one complete line.
    pub fn write_record(&self, line: &[u8]) -> io::Result<()> {
        let guard = self.stream().lock();
        let mut slot = guard
            .try_borrow_mut()
            .map_err(|_| io::Error::from(io::ErrorKind::ResourceBusy))?;
        let file = slot
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        file.write_all(line)
    }
}
