//! Fixture program for the preload contract tests.
//!
//! Runs a script of libc calls through the ordinary dynamic symbols, so a
//! library preloaded ahead of libc sees them exactly as it would from a C
//! program. Each step prints one line on stdout, usually `<result> <errno>`
//! with `errno` read right after the call.

use std::ffi::{CStr, CString, c_char, c_int, c_void};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use std::{io, ptr, thread};

use clap::Parser;

/// Drives intercepted libc calls in a fixed order.
#[derive(Debug, Parser)]
#[command(name = "envtrace-fixture")]
struct Cli {
    /// Steps, each an operation followed by its arguments:
    ///
    ///   errno N                 preset errno before every later call
    ///   get NAME                getenv; prints the value or (unset)
    ///   set NAME VALUE          setenv with overwrite
    ///   unset NAME              unsetenv
    ///   open PATH FLAGS MODE    open; FLAGS from r w c x d, MODE octal or -
    ///   openat DIR NAME FLAGS MODE
    ///   creat PATH MODE
    ///   exec FORM PATH          one of execv execve execvp execvpe execl execle execlp
    ///   sh-exit N               fork, then execl /bin/sh -c "exit N"
    ///   fork NAME               the child looks up NAME and exits
    ///   fork-contended THREADS FORKS NAME
    ///   clone STATUS            the child returns STATUS
    ///   clone-ptid              clone with CLONE_PARENT_SETTID
    ///   churn THREADS ROUNDS    concurrent setenv/getenv per thread
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    steps: Vec<String>,
}

type Fallible<T> = Result<T, Box<dyn std::error::Error>>;

struct Script {
    args: std::vec::IntoIter<String>,
    preset_errno: c_int,
}

impl Script {
    fn word(&mut self, what: &str) -> Fallible<String> {
        self.args
            .next()
            .ok_or_else(|| format!("missing {what}").into())
    }

    fn c_word(&mut self, what: &str) -> Fallible<CString> {
        Ok(CString::new(self.word(what)?)?)
    }

    fn number(&mut self, what: &str) -> Fallible<c_int> {
        Ok(self.word(what)?.parse()?)
    }

    fn mode(&mut self) -> Fallible<Option<libc::mode_t>> {
        let word = self.word("mode")?;
        if word == "-" {
            return Ok(None);
        }
        Ok(Some(libc::mode_t::from_str_radix(&word, 8)?))
    }

    /// Run `call` with errno preset and return its result with the errno
    /// it left behind.
    fn call<T>(&self, call: impl FnOnce() -> T) -> (T, c_int) {
        set_errno(self.preset_errno);
        let result = call();
        (result, errno())
    }
}

fn errno() -> c_int {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn set_errno(value: c_int) {
    // SAFETY: the calling thread's errno slot.
    unsafe { *libc::__errno_location() = value };
}

fn open_flags(word: &str) -> Fallible<c_int> {
    let mut read = false;
    let mut write = false;
    let mut extra = 0;
    for c in word.chars() {
        match c {
            'r' => read = true,
            'w' => write = true,
            'c' => extra |= libc::O_CREAT,
            'x' => extra |= libc::O_EXCL,
            'd' => extra |= libc::O_DIRECTORY,
            other => return Err(format!("unknown open flag {other:?}").into()),
        }
    }
    let access = match (read, write) {
        (true, true) => libc::O_RDWR,
        (false, true) => libc::O_WRONLY,
        _ => libc::O_RDONLY,
    };
    Ok(access | extra)
}

fn close(fd: c_int) {
    if fd >= 0 {
        // SAFETY: a descriptor this process just opened.
        unsafe { libc::close(fd) };
    }
}

/// Wait for `pid`, killing it once `limit` passes. `None` means it hung.
fn wait_for(pid: libc::pid_t, limit: Duration) -> Option<c_int> {
    let deadline = Instant::now() + limit;
    let mut status = 0;
    loop {
        // SAFETY: plain syscalls on our own child.
        match unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) } {
            0 if Instant::now() < deadline => thread::sleep(Duration::from_millis(1)),
            0 => {
                unsafe {
                    libc::kill(pid, libc::SIGKILL);
                    libc::waitpid(pid, &mut status, 0);
                }
                return None;
            }
            _ if libc::WIFEXITED(status) => return Some(libc::WEXITSTATUS(status)),
            _ => return Some(-1),
        }
    }
}

fn child_lookup_then_exit(name: &CStr) -> ! {
    // SAFETY: only async-signal-tolerant work happens in the child.
    unsafe {
        libc::getenv(name.as_ptr());
        libc::_exit(0)
    }
}

extern "C" fn clone_child(arg: *mut c_void) -> c_int {
    arg as usize as c_int
}

const ARGV: [&CStr; 2] = [c"prog", c"-v"];
const ENVP: [&CStr; 1] = [c"A=1"];

fn null_terminated(items: &[&CStr]) -> Vec<*const c_char> {
    items
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect()
}

fn exec(form: &str, path: &CStr) -> Fallible<c_int> {
    let argv = null_terminated(&ARGV);
    let envp = null_terminated(&ENVP);
    let null = ptr::null::<c_char>();
    let p = path.as_ptr();
    let [arg0, arg1] = ARGV.map(CStr::as_ptr);
    // SAFETY: every vector is NULL-terminated and outlives the call.
    let rc = unsafe {
        match form {
            "execv" => libc::execv(p, argv.as_ptr()),
            "execve" => libc::execve(p, argv.as_ptr(), envp.as_ptr()),
            "execvp" => libc::execvp(p, argv.as_ptr()),
            "execvpe" => libc::execvpe(p, argv.as_ptr(), envp.as_ptr()),
            "execl" => libc::execl(p, arg0, arg1, null),
            "execle" => libc::execle(p, arg0, arg1, null, envp.as_ptr()),
            "execlp" => libc::execlp(p, arg0, arg1, null),
            other => return Err(format!("unknown exec form {other}").into()),
        }
    };
    Ok(rc)
}

fn fork_contended(threads: c_int, forks: c_int, name: &CStr) -> String {
    let stop = AtomicBool::new(false);
    let mut hung = 0;
    let mut children = Vec::new();
    thread::scope(|s| {
        for _ in 0..threads {
            s.spawn(|| {
                while !stop.load(Ordering::Relaxed) {
                    // SAFETY: NUL-terminated literal.
                    unsafe { libc::getenv(c"ENVTRACE_SPIN".as_ptr()) };
                }
            });
        }
        for _ in 0..forks {
            // SAFETY: the child only looks up `name` and exits.
            let pid = unsafe { libc::fork() };
            if pid == 0 {
                child_lookup_then_exit(name);
            }
            if pid < 0 {
                break;
            }
            if wait_for(pid, Duration::from_secs(10)).is_none() {
                hung += 1;
            }
            children.push(pid.to_string());
        }
        stop.store(true, Ordering::Relaxed);
    });
    format!("{hung} {}", children.join(","))
}

fn churn(threads: c_int, rounds: c_int) {
    thread::scope(|s| {
        for worker in 0..threads {
            s.spawn(move || {
                let name = CString::new(format!("ENVTRACE_IT_THREAD_{worker}")).unwrap_or_default();
                for round in 0..rounds {
                    let value = CString::new(round.to_string()).unwrap_or_default();
                    // SAFETY: NUL-terminated strings owned by this thread.
                    unsafe {
                        libc::setenv(name.as_ptr(), value.as_ptr(), 1);
                        libc::getenv(name.as_ptr());
                    }
                }
                unsafe { libc::unsetenv(name.as_ptr()) };
            });
        }
    });
}

fn step(script: &mut Script, op: &str) -> Fallible<Option<String>> {
    let line = match op {
        "errno" => {
            script.preset_errno = script.number("errno")?;
            return Ok(None);
        }
        "get" => {
            let name = script.c_word("name")?;
            let (value, err) = script.call(|| unsafe { libc::getenv(name.as_ptr()) });
            let shown = if value.is_null() {
                "(unset)".to_owned()
            } else {
                unsafe { CStr::from_ptr(value) }.to_string_lossy().into_owned()
            };
            format!("{shown} {err}")
        }
        "set" => {
            let name = script.c_word("name")?;
            let value = script.c_word("value")?;
            let (rc, err) =
                script.call(|| unsafe { libc::setenv(name.as_ptr(), value.as_ptr(), 1) });
            format!("{rc} {err}")
        }
        "unset" => {
            let name = script.c_word("name")?;
            let (rc, err) = script.call(|| unsafe { libc::unsetenv(name.as_ptr()) });
            format!("{rc} {err}")
        }
        "open" => {
            let path = script.c_word("path")?;
            let flags = open_flags(&script.word("flags")?)?;
            let (fd, err) = match script.mode()? {
                Some(mode) => script.call(|| unsafe {
                    libc::open(path.as_ptr(), flags, libc::c_uint::from(mode))
                }),
                None => script.call(|| unsafe { libc::open(path.as_ptr(), flags) }),
            };
            close(fd);
            format!("{fd} {err}")
        }
        "openat" => {
            let dir = script.c_word("directory")?;
            let name = script.c_word("name")?;
            let flags = open_flags(&script.word("flags")?)?;
            let mode = script.mode()?;
            let dirfd = unsafe { libc::open(dir.as_ptr(), libc::O_RDONLY | libc::O_DIRECTORY) };
            let (fd, err) = match mode {
                Some(mode) => script.call(|| unsafe {
                    libc::openat(dirfd, name.as_ptr(), flags, libc::c_uint::from(mode))
                }),
                None => script.call(|| unsafe { libc::openat(dirfd, name.as_ptr(), flags) }),
            };
            close(fd);
            close(dirfd);
            format!("{fd} {err} {dirfd}")
        }
        "creat" => {
            let path = script.c_word("path")?;
            let mode = script.mode()?.unwrap_or(0o644);
            let (fd, err) = script.call(|| unsafe { libc::creat(path.as_ptr(), mode) });
            close(fd);
            format!("{fd} {err}")
        }
        "exec" => {
            let form = script.word("exec form")?;
            let path = script.c_word("path")?;
            set_errno(script.preset_errno);
            let rc = exec(&form, &path)?;
            format!("{rc} {}", errno())
        }
        "sh-exit" => {
            let code = script.c_word("exit status")?;
            let command = CString::new(format!("exit {}", code.to_string_lossy()))?;
            let pid = unsafe { libc::fork() };
            if pid == 0 {
                unsafe {
                    libc::execl(
                        c"/bin/sh".as_ptr(),
                        c"sh".as_ptr(),
                        c"-c".as_ptr(),
                        command.as_ptr(),
                        ptr::null::<c_char>(),
                    );
                    libc::_exit(127);
                }
            }
            let status = wait_for(pid, Duration::from_secs(30)).unwrap_or(-1);
            format!("{pid} {status}")
        }
        "fork" => {
            let name = script.c_word("name")?;
            let pid = unsafe { libc::fork() };
            if pid == 0 {
                child_lookup_then_exit(&name);
            }
            let status = wait_for(pid, Duration::from_secs(10)).unwrap_or(-1);
            format!("{pid} {status}")
        }
        "fork-contended" => {
            let threads = script.number("thread count")?;
            let forks = script.number("fork count")?;
            let name = script.c_word("name")?;
            fork_contended(threads, forks, &name)
        }
        "clone" => {
            let code = script.number("child status")?;
            let mut stack = vec![0u8; 256 * 1024];
            let top = unsafe { stack.as_mut_ptr().add(stack.len()) }.cast::<c_void>();
            let arg = code as usize as *mut c_void;
            let (pid, err) =
                script.call(|| unsafe { libc::clone(clone_child, top, libc::SIGCHLD, arg) });
            let status = wait_for(pid, Duration::from_secs(10)).unwrap_or(-1);
            format!("{pid} {status} {err}")
        }
        "clone-ptid" => {
            let mut stack = vec![0u8; 256 * 1024];
            let top = unsafe { stack.as_mut_ptr().add(stack.len()) }.cast::<c_void>();
            let mut parent_tid: libc::pid_t = 0;
            let flags = libc::SIGCHLD | libc::CLONE_PARENT_SETTID;
            let pid = unsafe {
                libc::clone(
                    clone_child,
                    top,
                    flags,
                    ptr::null_mut(),
                    &mut parent_tid as *mut libc::pid_t,
                )
            };
            wait_for(pid, Duration::from_secs(10));
            format!("{pid} {parent_tid}")
        }
        "churn" => {
            let threads = script.number("thread count")?;
            let rounds = script.number("round count")?;
            churn(threads, rounds);
            "0 0".to_owned()
        }
        other => return Err(format!("unknown step {other}").into()),
    };
    Ok(Some(line))
}

fn main() -> Fallible<()> {
    let cli = Cli::parse();
    let mut script = Script {
        args: cli.steps.into_iter(),
        preset_errno: 0,
    };
    while let Some(op) = script.args.next() {
        if let Some(line) = step(&mut script, &op)? {
            println!("{line}");
        }
    }
    Ok(())
}
