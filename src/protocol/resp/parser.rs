//! RESP Command Parser
//!
//! Parses client requests in the two forms RESP allows:
//!
//! - **Array form**: `*<n>\r\n` followed by `n` bulk strings
//!   (`$<len>\r\n<bytes>\r\n`), which is what every real client sends.
//! - **Inline form**: a single CRLF-terminated line split on whitespace,
//!   which is what a human typing into netcat sends.
//!
//! The parser is incremental: it either yields a complete command and the
//! number of bytes it consumed, reports that the buffer is incomplete, or
//! fails with a protocol error. The caller appends network reads to its
//! buffer and retries, so partial commands and pipelined batches both
//! work out naturally.

use bytes::Bytes;
use thiserror::Error;

/// Maximum size of a single bulk string (512 MB, matching Redis).
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum number of arguments in one command.
pub const MAX_ARGS: usize = 1024 * 1024;

/// Errors that end the connection: the byte stream can no longer be
/// trusted to be framed correctly.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid multibulk length")]
    InvalidArrayLength,

    #[error("invalid bulk length")]
    InvalidBulkLength,

    #[error("expected '$', got {0:#04x}")]
    ExpectedBulkString(u8),

    #[error("bulk string missing trailing CRLF")]
    MissingCrlf,

    #[error("message too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Attempts to parse one command from `buf`.
///
/// Returns `Ok(Some((args, consumed)))` for a complete command (an empty
/// `args` means a blank line; skip it), `Ok(None)` when more bytes are
/// needed, and `Err` on malformed framing.
pub fn parse_command(buf: &[u8]) -> ParseResult<Option<(Vec<Bytes>, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }

    if buf[0] == b'*' {
        parse_array(buf)
    } else {
        parse_inline(buf)
    }
}

/// `*<n>\r\n` followed by `n` bulk strings.
fn parse_array(buf: &[u8]) -> ParseResult<Option<(Vec<Bytes>, usize)>> {
    let Some(header_end) = find_crlf(&buf[1..]) else {
        return Ok(None);
    };

    let count = parse_int(&buf[1..1 + header_end]).ok_or(ParseError::InvalidArrayLength)?;
    if count < 0 || count as usize > MAX_ARGS {
        return Err(ParseError::InvalidArrayLength);
    }

    let mut args = Vec::with_capacity(count as usize);
    let mut consumed = 1 + header_end + 2;

    for _ in 0..count {
        match parse_bulk(&buf[consumed..])? {
            Some((arg, used)) => {
                args.push(arg);
                consumed += used;
            }
            None => return Ok(None),
        }
    }

    Ok(Some((args, consumed)))
}

/// `$<len>\r\n<bytes>\r\n`
fn parse_bulk(buf: &[u8]) -> ParseResult<Option<(Bytes, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf[0] != b'$' {
        return Err(ParseError::ExpectedBulkString(buf[0]));
    }

    let Some(len_end) = find_crlf(&buf[1..]) else {
        return Ok(None);
    };

    let len = parse_int(&buf[1..1 + len_end]).ok_or(ParseError::InvalidBulkLength)?;
    if len < 0 {
        return Err(ParseError::InvalidBulkLength);
    }
    let len = len as usize;
    if len > MAX_BULK_SIZE {
        return Err(ParseError::TooLarge {
            size: len,
            max: MAX_BULK_SIZE,
        });
    }

    let data_start = 1 + len_end + 2;
    let total = data_start + len + 2;
    if buf.len() < total {
        return Ok(None);
    }

    if &buf[data_start + len..total] != b"\r\n" {
        return Err(ParseError::MissingCrlf);
    }

    let data = Bytes::copy_from_slice(&buf[data_start..data_start + len]);
    Ok(Some((data, total)))
}

/// A bare CRLF-terminated line, split on spaces and tabs. Binary safe:
/// the split works on raw bytes, no UTF-8 required.
fn parse_inline(buf: &[u8]) -> ParseResult<Option<(Vec<Bytes>, usize)>> {
    let Some(line_end) = find_crlf(buf) else {
        return Ok(None);
    };

    let args = buf[..line_end]
        .split(|&b| b == b' ' || b == b'\t')
        .filter(|part| !part.is_empty())
        .map(Bytes::copy_from_slice)
        .collect();

    Ok(Some((args, line_end + 2)))
}

fn parse_int(digits: &[u8]) -> Option<i64> {
    std::str::from_utf8(digits).ok()?.parse().ok()
}

#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(parts: &[&str]) -> Vec<Bytes> {
        parts.iter().map(|p| Bytes::copy_from_slice(p.as_bytes())).collect()
    }

    #[test]
    fn test_parse_array_command() {
        let input = b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n";
        let (cmd, consumed) = parse_command(input).unwrap().unwrap();
        assert_eq!(cmd, args(&["SET", "k", "v"]));
        assert_eq!(consumed, input.len());
    }

    #[test]
    fn test_parse_incomplete() {
        assert!(parse_command(b"").unwrap().is_none());
        assert!(parse_command(b"*2\r\n$3\r\nGET\r\n").unwrap().is_none());
        assert!(parse_command(b"*2\r\n$3\r\nGET\r\n$4\r\nna").unwrap().is_none());
        assert!(parse_command(b"*2").unwrap().is_none());
        // No CRLF yet: the inline form is incomplete too.
        assert!(parse_command(b"GET key").unwrap().is_none());
    }

    #[test]
    fn test_parse_pipelined() {
        let input = b"*1\r\n$4\r\nPING\r\n*1\r\n$4\r\nPING\r\n";
        let (cmd, consumed) = parse_command(input).unwrap().unwrap();
        assert_eq!(cmd, args(&["PING"]));
        assert_eq!(consumed, 14);

        let (cmd, _) = parse_command(&input[consumed..]).unwrap().unwrap();
        assert_eq!(cmd, args(&["PING"]));
    }

    #[test]
    fn test_parse_inline_command() {
        let (cmd, consumed) = parse_command(b"SET key value\r\n").unwrap().unwrap();
        assert_eq!(cmd, args(&["SET", "key", "value"]));
        assert_eq!(consumed, 15);

        // Extra whitespace collapses.
        let (cmd, _) = parse_command(b"GET   key\r\n").unwrap().unwrap();
        assert_eq!(cmd, args(&["GET", "key"]));

        // Blank line parses as an empty command.
        let (cmd, consumed) = parse_command(b"\r\nPING\r\n").unwrap().unwrap();
        assert!(cmd.is_empty());
        assert_eq!(consumed, 2);
    }

    #[test]
    fn test_parse_empty_bulk() {
        let (cmd, _) = parse_command(b"*2\r\n$3\r\nSET\r\n$0\r\n\r\n").unwrap().unwrap();
        assert_eq!(cmd[1], Bytes::new());
    }

    #[test]
    fn test_parse_binary_bulk() {
        let input = b"*2\r\n$3\r\nGET\r\n$5\r\nk\x00\r\ny\r\n";
        let (cmd, _) = parse_command(input).unwrap().unwrap();
        assert_eq!(cmd[1], Bytes::from(&b"k\x00\r\ny"[..]));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            parse_command(b"*x\r\n"),
            Err(ParseError::InvalidArrayLength)
        ));
        assert!(matches!(
            parse_command(b"*-1\r\n"),
            Err(ParseError::InvalidArrayLength)
        ));
        assert!(matches!(
            parse_command(b"*1\r\n+OK\r\n"),
            Err(ParseError::ExpectedBulkString(b'+'))
        ));
        assert!(matches!(
            parse_command(b"*1\r\n$-5\r\n"),
            Err(ParseError::InvalidBulkLength)
        ));
        assert!(matches!(
            parse_command(b"*1\r\n$2\r\nabXX"),
            Err(ParseError::MissingCrlf)
        ));
    }
}
