//! Reading records back.
//!
//! Used by test tooling to check that every line in a log is complete and
//! carries the field set its kind requires.

use super::Timestamp;
use super::escape::decode_field;
use crate::error::TraceError;
use crate::kind::CallKind;

/// An owned, decoded log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRecord {
    /// `(user, host)` when the line carries the identity prefix.
    pub identity: Option<(Option<Vec<u8>>, Vec<u8>)>,
    pub timestamp: Timestamp,
    pub kind: CallKind,
    pub ppid: i32,
    pub pid: i32,
    pub program: Vec<u8>,
    /// Kind-specific fields, decoded. `None` is the absent sentinel.
    pub fields: Vec<Option<Vec<u8>>>,
}

fn parse_int<T: std::str::FromStr>(token: &[u8], what: &str) -> Result<T, TraceError> {
    std::str::from_utf8(token)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| TraceError::malformed(format!("bad {what}")))
}

fn parse_timestamp(token: &[u8]) -> Result<Timestamp, TraceError> {
    let body = token
        .strip_suffix(b":")
        .ok_or_else(|| TraceError::malformed("timestamp not followed by ':'"))?;
    let dot = body
        .iter()
        .rposition(|&b| b == b'.')
        .ok_or_else(|| TraceError::malformed("timestamp without '.'"))?;
    let (secs, nanos) = (&body[..dot], &body[dot + 1..]);
    if nanos.len() != 9 {
        return Err(TraceError::malformed("nanoseconds not nine digits"));
    }
    Ok(Timestamp {
        secs: parse_int(secs, "seconds")?,
        nanos: parse_int(nanos, "nanoseconds")?,
    })
}

fn decode(token: &[u8]) -> Result<Option<Vec<u8>>, TraceError> {
    decode_field(token).map_err(TraceError::malformed)
}

impl ParsedRecord {
    /// Parse one line; a trailing newline is accepted but not required.
    pub fn parse(line: &[u8]) -> Result<Self, TraceError> {
        let line = line.strip_suffix(b"\n").unwrap_or(line);
        if line.contains(&b'\n') {
            return Err(TraceError::malformed("embedded newline"));
        }
        let mut tokens = line.split(|&b| b == b' ');
        let mut next = |what: &str| {
            tokens
                .next()
                .filter(|t| !t.is_empty())
                .ok_or_else(|| TraceError::malformed(format!("missing {what}")))
        };

        let first = next("timestamp")?;
        let (identity, stamp) = if first.ends_with(b":") {
            (None, first)
        } else {
            let at = first
                .iter()
                .rposition(|&b| b == b'@')
                .ok_or_else(|| TraceError::malformed("identity without '@'"))?;
            let user = decode(&first[..at])?;
            let host = decode(&first[at + 1..])?
                .ok_or_else(|| TraceError::malformed("absent host"))?;
            (Some((user, host)), next("timestamp")?)
        };
        let timestamp = parse_timestamp(stamp)?;

        let tag = next("kind")?;
        let kind = std::str::from_utf8(tag)
            .ok()
            .and_then(CallKind::from_tag)
            .ok_or_else(|| TraceError::malformed("unknown kind"))?;
        let ppid = parse_int(next("ppid")?, "ppid")?;
        let pid = parse_int(next("pid")?, "pid")?;
        let program = decode(next("program")?)?.unwrap_or_default();

        let rest: Vec<&[u8]> = tokens.collect();
        if rest.iter().any(|t| t.is_empty()) {
            return Err(TraceError::malformed("empty field"));
        }
        let expected = match kind {
            CallKind::Getenv => match rest.get(1).copied() {
                Some(b"HIT") => 3,
                Some(b"MISS") => 2,
                _ => return Err(TraceError::malformed("GETENV without HIT/MISS")),
            },
            other => other.field_count(),
        };
        if rest.len() != expected {
            return Err(TraceError::malformed(format!(
                "{kind} expects {expected} fields, found {}",
                rest.len()
            )));
        }
        let fields = rest
            .into_iter()
            .map(decode)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            identity,
            timestamp,
            kind,
            ppid,
            pid,
            program,
            fields,
        })
    }

    /// Decoded field `i` as UTF-8, if present and valid.
    #[must_use]
    pub fn field_str(&self, i: usize) -> Option<&str> {
        self.fields
            .get(i)?
            .as_deref()
            .and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Trailing integer result/descriptor field, for kinds that end in one.
    #[must_use]
    pub fn result(&self) -> Option<i64> {
        if self.kind == CallKind::Getenv {
            return None;
        }
        self.fields.last()?.as_deref().and_then(|b| {
            std::str::from_utf8(b).ok()?.parse().ok()
        })
    }
}
