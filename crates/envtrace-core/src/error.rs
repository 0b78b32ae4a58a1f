//! Error taxonomy for the shim.
//!
//! Only the first three variants are fatal. A delegated call failing (a file
//! that does not exist, an `execve` that returns) is never an error of this
//! module: it is recorded and handed back to the caller untouched.

use thiserror::Error;

use crate::config::{EXIT_LOG_OPEN, EXIT_LOG_PATH_UNSET, EXIT_SYMBOL_UNRESOLVED};
use crate::kind::CallKind;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("{var} is not set")]
    LogPathUnset { var: &'static str },
    #[error("couldn't open {path} for logging: {source}")]
    LogOpen {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("couldn't find original {}()", .kind.symbol_name())]
    SymbolUnresolved { kind: CallKind },
    #[error("argument list exceeds {limit} entries")]
    TooManyArgs { limit: usize },
    #[error("malformed record: {reason}")]
    MalformedRecord { reason: String },
}

impl TraceError {
    /// Process exit status for the fatal classes, `None` otherwise.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::LogPathUnset { .. } => Some(EXIT_LOG_PATH_UNSET),
            Self::LogOpen { .. } => Some(EXIT_LOG_OPEN),
            Self::SymbolUnresolved { .. } => Some(EXIT_SYMBOL_UNRESOLVED),
            Self::TooManyArgs { .. } | Self::MalformedRecord { .. } => None,
        }
    }

    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.exit_code().is_some()
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedRecord {
            reason: reason.into(),
        }
    }
}
