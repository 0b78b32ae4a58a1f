//! Field encoding.
//!
//! Every field of a log line is a single whitespace-free token so that lines
//! can be split positionally:
//! - `\`, bytes `<= 0x20` and `0x7f` become `\xHH`;
//! - an absent value is written [`ABSENT`], an empty one [`EMPTY`];
//! - a value spelling one of those sentinels gets its first byte escaped.

pub const ABSENT: &[u8] = b"(null)";
pub const EMPTY: &[u8] = b"\"\"";

const HEX: &[u8; 16] = b"0123456789abcdef";

#[inline]
fn needs_escape(b: u8) -> bool {
    b == b'\\' || b <= 0x20 || b == 0x7f
}

fn push_escaped_byte(out: &mut Vec<u8>, b: u8) {
    out.extend_from_slice(&[b'\\', b'x', HEX[(b >> 4) as usize], HEX[(b & 0x0f) as usize]]);
}

/// Append one encoded field to `out`.
pub fn push_field(out: &mut Vec<u8>, value: Option<&[u8]>) {
    let Some(bytes) = value else {
        out.extend_from_slice(ABSENT);
        return;
    };
    if bytes.is_empty() {
        out.extend_from_slice(EMPTY);
        return;
    }

    let mut rest = bytes;
    if bytes == ABSENT || bytes == EMPTY {
        push_escaped_byte(out, bytes[0]);
        rest = &bytes[1..];
    }
    for &b in rest {
        if needs_escape(b) {
            push_escaped_byte(out, b);
        } else {
            out.push(b);
        }
    }
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Decode one field token. `Ok(None)` is the absent sentinel.
pub fn decode_field(token: &[u8]) -> Result<Option<Vec<u8>>, &'static str> {
    if token == ABSENT {
        return Ok(None);
    }
    if token == EMPTY {
        return Ok(Some(Vec::new()));
    }

    let mut out = Vec::with_capacity(token.len());
    let mut i = 0;
    while i < token.len() {
        let b = token[i];
        if b != b'\\' {
            out.push(b);
            i += 1;
            continue;
        }
        if token.get(i + 1) != Some(&b'x') {
            return Err("dangling escape");
        }
        let hi = token.get(i + 2).copied().and_then(hex_value);
        let lo = token.get(i + 3).copied().and_then(hex_value);
        match (hi, lo) {
            (Some(hi), Some(lo)) => out.push((hi << 4) | lo),
            _ => return Err("bad hex escape"),
        }
        i += 4;
    }
    Ok(Some(out))
}
