//! Protocol Detection
//!
//! Every connection starts the same way: peek at the first few bytes
//! without consuming them, decide which dialect the client speaks, and
//! hand the connection to that dialect's handler. The handler must see
//! the peeked bytes again, so the stream is wrapped in a [`PeekStream`]
//! that replays the peek buffer before reading from the socket.
//!
//! ## Classification rules (in priority order)
//!
//! 1. First byte in `* $ + - :`: RESP.
//! 2. An HTTP method followed by a space: HTTP.
//! 3. A memcache verb: memcache text.
//! 4. Bytes 4..8 equal `00 03 00 00` (Postgres startup, protocol
//!    version 196608): Postgres.
//! 5. Anything else, including an empty stream: RESP.

use bytes::BytesMut;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// How many bytes the detector peeks at most.
const PEEK_SIZE: usize = 8;

const HTTP_VERBS: [&[u8]; 7] = [
    b"GET ", b"POST ", b"PUT ", b"DELETE ", b"HEAD ", b"OPTIONS ", b"PATCH ",
];

const MEMCACHE_VERBS: [&[u8]; 10] = [
    b"get ", b"set ", b"add ", b"replace ", b"delete ", b"incr ", b"decr ", b"stats", b"flush",
    b"version",
];

/// The wire dialects ferrocache understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Resp,
    Http,
    Memcache,
    Postgres,
}

/// Classifies a peek buffer. This is the full rule set; it assumes no
/// more bytes are coming.
pub fn classify(peek: &[u8]) -> Dialect {
    if peek.is_empty() {
        return Dialect::Resp;
    }

    if matches!(peek[0], b'*' | b'$' | b'+' | b'-' | b':') {
        return Dialect::Resp;
    }

    if HTTP_VERBS.iter().any(|verb| peek.starts_with(verb)) {
        return Dialect::Http;
    }

    if MEMCACHE_VERBS.iter().any(|verb| peek.starts_with(verb)) {
        return Dialect::Memcache;
    }

    if peek.len() >= PEEK_SIZE && peek[4..8] == [0x00, 0x03, 0x00, 0x00] {
        return Dialect::Postgres;
    }

    Dialect::Resp
}

/// Whether more bytes could still change the classification of `peek`.
/// Keeps the detector from stalling on short inline commands while still
/// waiting out partial verbs and the 8-byte Postgres signature.
fn needs_more(peek: &[u8]) -> bool {
    if peek.len() >= PEEK_SIZE {
        return false;
    }

    let verb_possible = HTTP_VERBS
        .iter()
        .chain(MEMCACHE_VERBS.iter())
        .any(|verb| verb.len() > peek.len() && verb.starts_with(peek));

    let postgres_signature = [0x00, 0x03, 0x00, 0x00];
    let postgres_possible = if peek.len() <= 4 {
        true
    } else {
        postgres_signature.starts_with(&peek[4..])
    };

    verb_possible || postgres_possible
}

/// Incremental classification: `None` means read more first.
fn try_classify(peek: &[u8]) -> Option<Dialect> {
    if peek.is_empty() {
        return None;
    }
    if matches!(peek[0], b'*' | b'$' | b'+' | b'-' | b':') {
        return Some(Dialect::Resp);
    }
    if HTTP_VERBS.iter().any(|verb| peek.starts_with(verb)) {
        return Some(Dialect::Http);
    }
    if MEMCACHE_VERBS.iter().any(|verb| peek.starts_with(verb)) {
        return Some(Dialect::Memcache);
    }
    if needs_more(peek) {
        return None;
    }
    Some(classify(peek))
}

/// Peeks at the start of `stream`, classifies the dialect, and returns
/// the stream wrapped so the peeked bytes are replayed to the handler.
pub async fn detect<S>(mut stream: S) -> io::Result<(Dialect, PeekStream<S>)>
where
    S: AsyncRead + Unpin,
{
    let mut peek = BytesMut::with_capacity(PEEK_SIZE);

    let dialect = loop {
        if let Some(dialect) = try_classify(&peek) {
            break dialect;
        }
        let n = stream.read_buf(&mut peek).await?;
        if n == 0 || peek.len() >= PEEK_SIZE {
            break classify(&peek);
        }
    };

    Ok((dialect, PeekStream::new(peek, stream)))
}

/// A stream wrapper that serves the detector's peek buffer before
/// reading from the underlying connection. Writes pass straight through.
#[derive(Debug)]
pub struct PeekStream<S> {
    prefix: BytesMut,
    inner: S,
}

impl<S> PeekStream<S> {
    pub fn new(prefix: BytesMut, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix.split_to(n));
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
