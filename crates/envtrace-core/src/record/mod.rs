//! Event record model and its one-line text encoding.
//!
//! A record is a common header followed by kind-specific fields:
//!
//! ```text
//! [<user>@<host> ]<secs>.<nanos>: <KIND> <ppid> <pid> <program> <fields...>
//! ```
//!
//! | KIND | fields |
//! |---|---|
//! | `GETENV` | name `HIT` value, or name `MISS` |
//! | `SETENV` | name prior value result |
//! | `UNSET` | name prior result |
//! | `FORK` | child pid (or -1) |
//! | `CLONE` | result |
//! | `OPEN`, `CREAT` | path fd |
//! | `OPENAT` | dirfd path fd |
//! | `EXEC*` | path-or-file result |
//!
//! Field order per kind never varies: log consumers split lines positionally.
//! Fields are encoded by [`escape::push_field`].

pub mod escape;
mod parse;

use std::io::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::kind::CallKind;

pub use parse::ParsedRecord;

/// Wall-clock time of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    pub secs: i64,
    pub nanos: u32,
}

impl Timestamp {
    #[must_use]
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    #[must_use]
    pub fn from_system_time(t: SystemTime) -> Self {
        match t.duration_since(UNIX_EPOCH) {
            Ok(d) => Self {
                secs: d.as_secs() as i64,
                nanos: d.subsec_nanos(),
            },
            Err(e) => {
                // Before the epoch: normalize to a negative second count with
                // non-negative nanos, as `clock_gettime` reports it.
                let d = e.duration();
                let mut secs = -(d.as_secs() as i64);
                let mut nanos = d.subsec_nanos();
                if nanos > 0 {
                    secs -= 1;
                    nanos = 1_000_000_000 - nanos;
                }
                Self { secs, nanos }
            }
        }
    }
}

/// Acting user and host, present in the fullest record variant only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity<'a> {
    pub user: Option<&'a [u8]>,
    pub host: &'a [u8],
}

/// Fields common to every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHeader<'a> {
    pub identity: Option<Identity<'a>>,
    pub timestamp: Timestamp,
    pub ppid: i32,
    pub pid: i32,
    pub program: &'a [u8],
}

/// Kind-specific fields. `None` stands for a NULL pointer argument or result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDetail<'a> {
    Getenv {
        name: Option<&'a [u8]>,
        value: Option<&'a [u8]>,
    },
    Setenv {
        name: Option<&'a [u8]>,
        prior: Option<&'a [u8]>,
        value: Option<&'a [u8]>,
        result: i32,
    },
    Unsetenv {
        name: Option<&'a [u8]>,
        prior: Option<&'a [u8]>,
        result: i32,
    },
    Fork {
        child: i32,
    },
    Clone {
        result: i32,
    },
    Open {
        path: Option<&'a [u8]>,
        fd: i32,
    },
    OpenAt {
        dirfd: i32,
        path: Option<&'a [u8]>,
        fd: i32,
    },
    Creat {
        path: Option<&'a [u8]>,
        fd: i32,
    },
    /// Any member of the `exec` family; `kind` says which.
    Exec {
        kind: CallKind,
        path: Option<&'a [u8]>,
        result: i32,
    },
}

impl CallDetail<'_> {
    #[must_use]
    pub fn kind(&self) -> CallKind {
        match self {
            Self::Getenv { .. } => CallKind::Getenv,
            Self::Setenv { .. } => CallKind::Setenv,
            Self::Unsetenv { .. } => CallKind::Unsetenv,
            Self::Fork { .. } => CallKind::Fork,
            Self::Clone { .. } => CallKind::Clone,
            Self::Open { .. } => CallKind::Open,
            Self::OpenAt { .. } => CallKind::OpenAt,
            Self::Creat { .. } => CallKind::Creat,
            Self::Exec { kind, .. } => *kind,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRecord<'a> {
    pub header: EventHeader<'a>,
    pub detail: CallDetail<'a>,
}

fn push_int(out: &mut Vec<u8>, v: impl std::fmt::Display) {
    // Writing into a Vec cannot fail.
    let _ = write!(out, "{v}");
}

impl EventRecord<'_> {
    #[must_use]
    pub fn kind(&self) -> CallKind {
        self.detail.kind()
    }

    /// Append the record, newline included, to `out`.
    pub fn write_line(&self, out: &mut Vec<u8>) {
        let h = &self.header;
        if let Some(id) = h.identity {
            escape::push_field(out, id.user);
            out.push(b'@');
            escape::push_field(out, Some(id.host));
            out.push(b' ');
        }
        let _ = write!(
            out,
            "{}.{:09}: {} {} {} ",
            h.timestamp.secs,
            h.timestamp.nanos,
            self.kind(),
            h.ppid,
            h.pid
        );
        escape::push_field(out, Some(h.program));

        match self.detail {
            CallDetail::Getenv { name, value } => {
                out.push(b' ');
                escape::push_field(out, name);
                match value {
                    Some(v) => {
                        out.extend_from_slice(b" HIT ");
                        escape::push_field(out, Some(v));
                    }
                    None => out.extend_from_slice(b" MISS"),
                }
            }
            CallDetail::Setenv {
                name,
                prior,
                value,
                result,
            } => {
                for field in [name, prior, value] {
                    out.push(b' ');
                    escape::push_field(out, field);
                }
                out.push(b' ');
                push_int(out, result);
            }
            CallDetail::Unsetenv {
                name,
                prior,
                result,
            } => {
                for field in [name, prior] {
                    out.push(b' ');
                    escape::push_field(out, field);
                }
                out.push(b' ');
                push_int(out, result);
            }
            CallDetail::Fork { child: result } | CallDetail::Clone { result } => {
                out.push(b' ');
                push_int(out, result);
            }
            CallDetail::Open { path, fd } | CallDetail::Creat { path, fd } => {
                out.push(b' ');
                escape::push_field(out, path);
                out.push(b' ');
                push_int(out, fd);
            }
            CallDetail::OpenAt { dirfd, path, fd } => {
                out.push(b' ');
                push_int(out, dirfd);
                out.push(b' ');
                escape::push_field(out, path);
                out.push(b' ');
                push_int(out, fd);
            }
            CallDetail::Exec { path, result, .. } => {
                out.push(b' ');
                escape::push_field(out, path);
                out.push(b' ');
                push_int(out, result);
            }
        }
        out.push(b'\n');
    }

    #[must_use]
    pub fn to_line(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        self.write_line(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn header(identity: Option<Identity<'static>>) -> EventHeader<'static> {
        EventHeader {
            identity,
            timestamp: Timestamp {
                secs: 1_700_000_000,
                nanos: 5,
            },
            ppid: 10,
            pid: 42,
            program: b"/usr/bin/make",
        }
    }

    fn full() -> EventHeader<'static> {
        header(Some(Identity {
            user: Some(b"alice"),
            host: b"build01",
        }))
    }

    fn line(detail: CallDetail<'_>) -> String {
        let rec = EventRecord {
            header: full(),
            detail,
        };
        String::from_utf8(rec.to_line()).unwrap()
    }

    #[test]
    fn getenv_hit_and_miss() {
        assert_eq!(
            line(CallDetail::Getenv {
                name: Some(b"PATH"),
                value: Some(b"/bin"),
            }),
            "alice@build01 1700000000.000000005: GETENV 10 42 /usr/bin/make PATH HIT /bin\n"
        );
        assert_eq!(
            line(CallDetail::Getenv {
                name: Some(b"FOO"),
                value: None,
            }),
            "alice@build01 1700000000.000000005: GETENV 10 42 /usr/bin/make FOO MISS\n"
        );
    }

    #[test]
    fn setenv_records_prior_new_and_result() {
        assert_eq!(
            line(CallDetail::Setenv {
                name: Some(b"FOO"),
                prior: Some(b"baz"),
                value: Some(b"bar"),
                result: 0,
            }),
            "alice@build01 1700000000.000000005: SETENV 10 42 /usr/bin/make FOO baz bar 0\n"
        );
        assert!(
            line(CallDetail::Setenv {
                name: Some(b"FOO"),
                prior: None,
                value: Some(b""),
                result: 0,
            })
            .ends_with(" FOO (null) \"\" 0\n")
        );
    }

    #[test]
    fn unset_fork_clone_lines() {
        assert!(
            line(CallDetail::Unsetenv {
                name: Some(b"FOO"),
                prior: Some(b"bar"),
                result: 0,
            })
            .ends_with(": UNSET 10 42 /usr/bin/make FOO bar 0\n")
        );
        assert!(line(CallDetail::Fork { child: 4711 }).ends_with(": FORK 10 42 /usr/bin/make 4711\n"));
        assert!(line(CallDetail::Clone { result: -1 }).ends_with(": CLONE 10 42 /usr/bin/make -1\n"));
    }

    #[test]
    fn open_family_lines() {
        assert!(
            line(CallDetail::Open {
                path: Some(b"/etc/passwd"),
                fd: 3,
            })
            .ends_with(": OPEN 10 42 /usr/bin/make /etc/passwd 3\n")
        );
        assert!(
            line(CallDetail::OpenAt {
                dirfd: -100,
                path: Some(b"rel/file"),
                fd: -1,
            })
            .ends_with(": OPENAT 10 42 /usr/bin/make -100 rel/file -1\n")
        );
        assert!(
            line(CallDetail::Creat {
                path: Some(b"out.o"),
                fd: 5,
            })
            .ends_with(": CREAT 10 42 /usr/bin/make out.o 5\n")
        );
    }

    #[test]
    fn exec_lines_carry_their_own_kind() {
        let text = line(CallDetail::Exec {
            kind: CallKind::Execlp,
            path: Some(b"cc"),
            result: -1,
        });
        assert!(text.ends_with(": EXECLP 10 42 /usr/bin/make cc -1\n"));
    }

    #[test]
    fn light_variant_omits_identity() {
        let rec = EventRecord {
            header: header(None),
            detail: CallDetail::Fork { child: 7 },
        };
        assert_eq!(
            rec.to_line(),
            b"1700000000.000000005: FORK 10 42 /usr/bin/make 7\n"
        );
    }

    #[test]
    fn missing_user_prints_null_sentinel() {
        let rec = EventRecord {
            header: header(Some(Identity {
                user: None,
                host: b"h",
            })),
            detail: CallDetail::Fork { child: 7 },
        };
        assert!(rec.to_line().starts_with(b"(null)@h "));
    }

    #[test]
    fn embedded_newline_stays_on_one_line() {
        let text = line(CallDetail::Getenv {
            name: Some(b"PS1"),
            value: Some(b"line one\nline two"),
        });
        assert_eq!(text.matches('\n').count(), 1);
        assert!(text.ends_with("PS1 HIT line\\x20one\\x0aline\\x20two\n"));
    }

    #[test]
    fn timestamp_before_epoch_is_normalized() {
        let t = UNIX_EPOCH - Duration::new(1, 250_000_000);
        assert_eq!(
            Timestamp::from_system_time(t),
            Timestamp {
                secs: -2,
                nanos: 750_000_000,
            }
        );
        assert_eq!(
            Timestamp::from_system_time(UNIX_EPOCH + Duration::new(3, 7)),
            Timestamp { secs: 3, nanos: 7 }
        );
    }
}
