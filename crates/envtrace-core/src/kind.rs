//! The fixed set of intercepted call kinds.
//!
//! Each kind corresponds to exactly one exported symbol. The kind's tag is the
//! word written into the log line; its symbol name is what gets looked up in
//! the next object of the dynamic linker's search order.

use std::ffi::CStr;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CallKind {
    Getenv,
    Setenv,
    Unsetenv,
    Fork,
    Clone,
    Open,
    OpenAt,
    Creat,
    Execv,
    Execl,
    Execve,
    Execle,
    Execvp,
    Execlp,
    Execvpe,
}

impl CallKind {
    pub const COUNT: usize = 15;

    pub const ALL: [CallKind; Self::COUNT] = [
        Self::Getenv,
        Self::Setenv,
        Self::Unsetenv,
        Self::Fork,
        Self::Clone,
        Self::Open,
        Self::OpenAt,
        Self::Creat,
        Self::Execv,
        Self::Execl,
        Self::Execve,
        Self::Execle,
        Self::Execvp,
        Self::Execlp,
        Self::Execvpe,
    ];

    /// Dense index, used for per-symbol tables.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Tag written into the log line.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Getenv => "GETENV",
            Self::Setenv => "SETENV",
            Self::Unsetenv => "UNSET",
            Self::Fork => "FORK",
            Self::Clone => "CLONE",
            Self::Open => "OPEN",
            Self::OpenAt => "OPENAT",
            Self::Creat => "CREAT",
            Self::Execv => "EXECV",
            Self::Execl => "EXECL",
            Self::Execve => "EXECVE",
            Self::Execle => "EXECLE",
            Self::Execvp => "EXECVP",
            Self::Execlp => "EXECLP",
            Self::Execvpe => "EXECVPE",
        }
    }

    /// NUL-terminated symbol name for the dynamic linker.
    #[must_use]
    pub const fn c_symbol(self) -> &'static CStr {
        match self {
            Self::Getenv => c"getenv",
            Self::Setenv => c"setenv",
            Self::Unsetenv => c"unsetenv",
            Self::Fork => c"fork",
            Self::Clone => c"clone",
            Self::Open => c"open",
            Self::OpenAt => c"openat",
            Self::Creat => c"creat",
            Self::Execv => c"execv",
            Self::Execl => c"execl",
            Self::Execve => c"execve",
            Self::Execle => c"execle",
            Self::Execvp => c"execvp",
            Self::Execlp => c"execlp",
            Self::Execvpe => c"execvpe",
        }
    }

    #[must_use]
    pub fn symbol_name(self) -> &'static str {
        // Symbol names are plain ASCII literals.
        self.c_symbol().to_str().unwrap_or("?")
    }

    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.tag() == tag)
    }

    /// Vector-form symbol a list-form `exec` delegates to.
    #[must_use]
    pub const fn vector_form(self) -> Option<Self> {
        match self {
            Self::Execl => Some(Self::Execv),
            Self::Execle => Some(Self::Execve),
            Self::Execlp => Some(Self::Execvp),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_exec(self) -> bool {
        matches!(
            self,
            Self::Execv
                | Self::Execl
                | Self::Execve
                | Self::Execle
                | Self::Execvp
                | Self::Execlp
                | Self::Execvpe
        )
    }

    /// Number of kind-specific fields following the common header.
    ///
    /// `GETENV` is the only kind with two shapes: `name HIT value` and
    /// `name MISS`; this returns the longer one.
    #[must_use]
    pub const fn field_count(self) -> usize {
        match self {
            Self::Getenv => 3,
            Self::Setenv => 4,
            Self::Unsetenv => 3,
            Self::Fork | Self::Clone => 1,
            Self::Open | Self::Creat => 2,
            Self::OpenAt => 3,
            _ => 2,
        }
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}
