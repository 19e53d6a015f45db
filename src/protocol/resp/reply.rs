//! RESP Reply Encoding
//!
//! The server side of RESP2: every response is one of five encodings,
//! each introduced by a type prefix byte and terminated by CRLF.
//!
//! - Simple string: `+OK\r\n`
//! - Error: `-ERR unknown command\r\n`
//! - Integer: `:1000\r\n`
//! - Bulk string: `$5\r\nhello\r\n` (binary safe; nil is `$-1\r\n`)
//! - Array: `*2\r\n` followed by the elements

use bytes::{BufMut, Bytes, BytesMut};

/// A RESP reply ready to be encoded onto the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    Nil,
    Array(Vec<Reply>),
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Simple("OK".to_string())
    }

    pub fn pong() -> Self {
        Reply::Simple("PONG".to_string())
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Reply::Error(msg.into())
    }

    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Reply::Bulk(data.into())
    }

    /// Standard arity error for `command`.
    pub fn wrong_args(command: &str) -> Self {
        Reply::Error(format!(
            "ERR wrong number of arguments for '{}' command",
            command.to_lowercase()
        ))
    }

    /// Appends the wire encoding of this reply to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Reply::Simple(s) => {
                buf.put_u8(b'+');
                buf.put_slice(s.as_bytes());
                buf.put_slice(b"\r\n");
            }
            Reply::Error(s) => {
                buf.put_u8(b'-');
                buf.put_slice(s.as_bytes());
                buf.put_slice(b"\r\n");
            }
            Reply::Integer(n) => {
                buf.put_u8(b':');
                buf.put_slice(n.to_string().as_bytes());
                buf.put_slice(b"\r\n");
            }
            Reply::Bulk(data) => {
                buf.put_u8(b'$');
                buf.put_slice(data.len().to_string().as_bytes());
                buf.put_slice(b"\r\n");
                buf.put_slice(data);
                buf.put_slice(b"\r\n");
            }
            Reply::Nil => buf.put_slice(b"$-1\r\n"),
            Reply::Array(elements) => {
                buf.put_u8(b'*');
                buf.put_slice(elements.len().to_string().as_bytes());
                buf.put_slice(b"\r\n");
                for element in elements {
                    element.encode(buf);
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_and_error() {
        assert_eq!(&Reply::ok().to_bytes()[..], b"+OK\r\n");
        assert_eq!(&Reply::pong().to_bytes()[..], b"+PONG\r\n");
        assert_eq!(
            &Reply::error("ERR unknown command 'FOO'").to_bytes()[..],
            b"-ERR unknown command 'FOO'\r\n"
        );
    }

    #[test]
    fn test_integer() {
        assert_eq!(&Reply::Integer(1000).to_bytes()[..], b":1000\r\n");
        assert_eq!(&Reply::Integer(-2).to_bytes()[..], b":-2\r\n");
    }

    #[test]
    fn test_bulk_and_nil() {
        assert_eq!(&Reply::bulk("hello").to_bytes()[..], b"$5\r\nhello\r\n");
        assert_eq!(&Reply::bulk("").to_bytes()[..], b"$0\r\n\r\n");
        assert_eq!(&Reply::Nil.to_bytes()[..], b"$-1\r\n");

        // Binary safe: embedded nulls and CRLF survive.
        let data = Bytes::from(&b"a\x00\r\nb"[..]);
        assert_eq!(&Reply::Bulk(data).to_bytes()[..], b"$5\r\na\x00\r\nb\r\n");
    }

    #[test]
    fn test_array() {
        let reply = Reply::Array(vec![Reply::bulk("v1"), Reply::Nil, Reply::Integer(3)]);
        assert_eq!(&reply.to_bytes()[..], b"*3\r\n$2\r\nv1\r\n$-1\r\n:3\r\n");

        assert_eq!(&Reply::Array(vec![]).to_bytes()[..], b"*0\r\n");
    }

    #[test]
    fn test_wrong_args() {
        assert_eq!(
            &Reply::wrong_args("GET").to_bytes()[..],
            b"-ERR wrong number of arguments for 'get' command\r\n"
        );
    }
}
