//! HTTP/1.1 Dialect
//!
//! A REST-flavored adapter: the request path is the key. Requests are
//! parsed by hand because this handler runs on the detector-wrapped
//! stream (the first bytes were already peeked), so it cannot hand the
//! socket to a framework server.
//!
//! | Request | Behavior |
//! |---|---|
//! | `GET /<key>` | value bytes, `X-Flags` and `X-CAS` headers |
//! | `HEAD /<key>` | metadata headers only |
//! | `PUT`/`POST /<key>` | store body; honors `X-TTL`, `X-Flags`, `X-CAS` |
//! | `DELETE /<key>` | remove |
//! | `GET /stats` | JSON counter snapshot |
//! | `GET /keys?pattern=` | JSON array of matching keys |
//!
//! An `X-CAS` header on a store switches it to compare-and-swap: 409 on
//! mismatch. When an auth token is configured, every request must carry
//! `Authorization: Bearer <token>`.

use crate::cache::{Cache, StoreOptions};
use crate::protocol::glob::glob_match;
use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

/// Handles HTTP connections against a shared cache.
#[derive(Clone)]
pub struct HttpHandler {
    cache: Arc<Cache>,
    auth: Option<String>,
}

/// One parsed request. Header names are lowercased during parsing.
struct Request {
    method: String,
    path: String,
    query: String,
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl Request {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn query_param(&self, name: &str) -> Option<String> {
        self.query.split('&').find_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            (k == name).then(|| percent_decode(v))
        })
    }
}

impl HttpHandler {
    pub fn new(cache: Arc<Cache>, auth: Option<String>) -> Self {
        Self { cache, auth }
    }

    pub async fn handle<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);

        if let Err(e) = self.session(&mut reader, &mut writer).await {
            debug!(error = %e, "HTTP connection ended with error");
        }
    }

    async fn session<R, W>(&self, reader: &mut R, writer: &mut W) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut out = BytesMut::with_capacity(1024);

        loop {
            let request = match read_request(reader).await {
                Ok(Some(request)) => request,
                Ok(None) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    out.clear();
                    write_error(&mut out, 400, "Bad request");
                    writer.write_all(&out).await?;
                    writer.flush().await?;
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            out.clear();

            if let Some(token) = &self.auth {
                let authorized = request
                    .header("authorization")
                    .and_then(|v| v.strip_prefix("Bearer "))
                    .is_some_and(|t| t == token);
                if !authorized {
                    write_error(&mut out, 401, "Unauthorized");
                    writer.write_all(&out).await?;
                    writer.flush().await?;
                    continue;
                }
            }

            match request.method.as_str() {
                "GET" => self.do_get(&mut out, &request),
                "POST" | "PUT" => self.do_set(&mut out, &request),
                "DELETE" => self.do_delete(&mut out, &request),
                "HEAD" => self.do_head(&mut out, &request),
                _ => write_error(&mut out, 405, "Method not allowed"),
            }

            writer.write_all(&out).await?;
            writer.flush().await?;

            if request.header("connection") == Some("close") {
                return Ok(());
            }
        }
    }

    fn do_get(&self, out: &mut BytesMut, request: &Request) {
        if request.path.is_empty() || request.path == "stats" {
            return self.do_stats(out);
        }
        if request.path == "keys" {
            return self.do_keys(out, request);
        }

        let Some(entry) = self.cache.load(request.path.as_bytes()) else {
            return write_error(out, 404, "Key not found");
        };
        let value = entry.value();

        write_response(
            out,
            200,
            &[
                ("Content-Type", "application/octet-stream".to_string()),
                ("X-Flags", entry.flags().to_string()),
                ("X-CAS", entry.cas().to_string()),
            ],
            Some(&value),
        );
    }

    fn do_set(&self, out: &mut BytesMut, request: &Request) {
        if request.path.is_empty() {
            return write_error(out, 400, "Key required");
        }
        let key = Bytes::copy_from_slice(request.path.as_bytes());

        let mut opts = StoreOptions::default();
        if let Some(seconds) = request.header("x-ttl").and_then(|v| v.parse::<u64>().ok()) {
            if seconds > 0 {
                opts.ttl = Some(Duration::from_secs(seconds));
            }
        }
        if let Some(flags) = request.header("x-flags").and_then(|v| v.parse().ok()) {
            opts.flags = flags;
        }

        if let Some(cas) = request.header("x-cas").and_then(|v| v.parse::<u64>().ok()) {
            opts.cas = cas;
            if self
                .cache
                .compare_and_swap(&key, request.body.clone(), cas, Some(&opts))
            {
                return write_response(out, 200, &[], Some(b"OK"));
            }
            return write_error(out, 409, "CAS mismatch");
        }

        self.cache.store(key, request.body.clone(), Some(&opts));
        write_response(out, 201, &[], Some(b"OK"));
    }

    fn do_delete(&self, out: &mut BytesMut, request: &Request) {
        if request.path.is_empty() {
            return write_error(out, 400, "Key required");
        }
        if self.cache.delete(request.path.as_bytes()) {
            write_response(out, 200, &[], Some(b"OK"));
        } else {
            write_error(out, 404, "Key not found");
        }
    }

    fn do_head(&self, out: &mut BytesMut, request: &Request) {
        if request.path.is_empty() {
            return write_error(out, 400, "Key required");
        }
        let Some(entry) = self.cache.load(request.path.as_bytes()) else {
            return write_error(out, 404, "Key not found");
        };

        write_response(
            out,
            200,
            &[
                ("Content-Type", "application/octet-stream".to_string()),
                ("Content-Length", entry.value().len().to_string()),
                ("X-Flags", entry.flags().to_string()),
                ("X-CAS", entry.cas().to_string()),
            ],
            None,
        );
    }

    fn do_stats(&self, out: &mut BytesMut) {
        let stats = self.cache.stats();
        let body = serde_json::to_vec_pretty(&stats).unwrap_or_default();
        write_response(
            out,
            200,
            &[("Content-Type", "application/json".to_string())],
            Some(&body),
        );
    }

    fn do_keys(&self, out: &mut BytesMut, request: &Request) {
        let pattern = request.query_param("pattern").unwrap_or_else(|| "*".to_string());

        let mut keys: Vec<String> = Vec::new();
        self.cache.iterate(|entry| {
            if glob_match(pattern.as_bytes(), entry.key()) {
                keys.push(String::from_utf8_lossy(entry.key()).into_owned());
            }
            true
        });

        let body = serde_json::to_vec(&keys).unwrap_or_default();
        write_response(
            out,
            200,
            &[("Content-Type", "application/json".to_string())],
            Some(&body),
        );
    }
}

/// Reads one request. `None` means the peer closed before sending one.
async fn read_request<R>(reader: &mut R) -> io::Result<Option<Request>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::with_capacity(256);
    if reader.read_until(b'\n', &mut line).await? == 0 {
        return Ok(None);
    }

    let request_line = String::from_utf8_lossy(trim_line(&line)).into_owned();
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad request line"));
    };
    let method = method.to_string();

    let target = target.strip_prefix('/').unwrap_or(target);
    let (raw_path, query) = match target.split_once('?') {
        Some((p, q)) => (p, q.to_string()),
        None => (target, String::new()),
    };
    let path = percent_decode(raw_path);

    let mut headers = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Ok(None);
        }
        let header_line = trim_line(&line);
        if header_line.is_empty() {
            break;
        }
        let text = String::from_utf8_lossy(header_line);
        if let Some((name, value)) = text.split_once(':') {
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await?;

    Ok(Some(Request {
        method,
        path,
        query,
        headers,
        body: Bytes::from(body),
    }))
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        _ => "Internal Server Error",
    }
}

fn write_response(out: &mut BytesMut, status: u16, headers: &[(&str, String)], body: Option<&[u8]>) {
    out.put_slice(format!("HTTP/1.1 {} {}\r\n", status, status_text(status)).as_bytes());
    out.put_slice(b"Server: ferrocache/0.1\r\n");

    let mut wrote_length = false;
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("content-length") {
            wrote_length = true;
        }
        out.put_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    if !wrote_length {
        out.put_slice(format!("Content-Length: {}\r\n", body.map_or(0, <[u8]>::len)).as_bytes());
    }
    out.put_slice(b"\r\n");

    if let Some(body) = body {
        out.put_slice(body);
    }
}

fn write_error(out: &mut BytesMut, status: u16, message: &str) {
    let body = format!("{{\"error\":\"{}\"}}", message);
    write_response(
        out,
        status,
        &[("Content-Type", "application/json".to_string())],
        Some(body.as_bytes()),
    );
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let (Some(hi), Some(lo)) = (
                bytes.get(i + 1).and_then(|b| (*b as char).to_digit(16)),
                bytes.get(i + 2).and_then(|b| (*b as char).to_digit(16)),
            ) {
                decoded.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        decoded.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

fn trim_line(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn handler(auth: Option<&str>) -> HttpHandler {
        HttpHandler::new(Arc::new(Cache::new(16, 0)), auth.map(String::from))
    }

    async fn exchange(handler: HttpHandler, input: &[u8]) -> String {
        let (mut client, server) = duplex(64 * 1024);
        let task = tokio::spawn(async move { handler.handle(server).await });

        client.write_all(input).await.unwrap();
        client.shutdown().await.unwrap();

        let mut output = Vec::new();
        client.read_to_end(&mut output).await.unwrap();
        task.await.unwrap();
        String::from_utf8_lossy(&output).into_owned()
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let input: &[u8] = b"PUT /greeting HTTP/1.1\r\nContent-Length: 5\r\nX-Flags: 7\r\n\r\nhello\
                             GET /greeting HTTP/1.1\r\n\r\n";
        let out = exchange(handler(None), input).await;

        assert!(out.starts_with("HTTP/1.1 201 Created\r\n"));
        assert!(out.contains("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("X-Flags: 7\r\n"));
        assert!(out.contains("X-CAS: 0\r\n"));
        assert!(out.ends_with("hello"));
    }

    #[tokio::test]
    async fn test_get_missing_is_404() {
        let out = exchange(handler(None), b"GET /nope HTTP/1.1\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(out.contains("{\"error\":\"Key not found\"}"));
    }

    #[tokio::test]
    async fn test_head_has_no_body() {
        let input: &[u8] = b"PUT /k HTTP/1.1\r\nContent-Length: 3\r\n\r\nxyz\
                             HEAD /k HTTP/1.1\r\n\r\n";
        let out = exchange(handler(None), input).await;
        assert!(out.contains("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("Content-Length: 3\r\n"));
        assert!(!out.ends_with("xyz"));
    }

    #[tokio::test]
    async fn test_delete() {
        let input: &[u8] = b"PUT /k HTTP/1.1\r\nContent-Length: 1\r\n\r\nv\
                             DELETE /k HTTP/1.1\r\n\r\n\
                             DELETE /k HTTP/1.1\r\n\r\n";
        let out = exchange(handler(None), input).await;
        assert!(out.contains("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("HTTP/1.1 404 Not Found\r\n"));
    }

    #[tokio::test]
    async fn test_cas_store() {
        // Fresh entries start at CAS 0; a matching X-CAS succeeds (200),
        // a stale one conflicts (409).
        let input: &[u8] = b"PUT /k HTTP/1.1\r\nContent-Length: 2\r\n\r\nv1\
                             PUT /k HTTP/1.1\r\nContent-Length: 2\r\nX-CAS: 0\r\n\r\nv2\
                             PUT /k HTTP/1.1\r\nContent-Length: 2\r\nX-CAS: 0\r\n\r\nv3\
                             GET /k HTTP/1.1\r\n\r\n";
        let out = exchange(handler(None), input).await;
        assert!(out.contains("HTTP/1.1 201 Created\r\n"));
        assert!(out.contains("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("HTTP/1.1 409 Conflict\r\n"));
        assert!(out.ends_with("v2"));
    }

    #[tokio::test]
    async fn test_stats_json() {
        let out = exchange(handler(None), b"GET /stats HTTP/1.1\r\n\r\n").await;
        assert!(out.contains("Content-Type: application/json\r\n"));
        assert!(out.contains("\"num_items\""));
        assert!(out.contains("\"hit_rate\""));
    }

    #[tokio::test]
    async fn test_keys_pattern() {
        let input: &[u8] = b"PUT /a HTTP/1.1\r\nContent-Length: 1\r\n\r\n1\
                             PUT /ab HTTP/1.1\r\nContent-Length: 1\r\n\r\n2\
                             PUT /b HTTP/1.1\r\nContent-Length: 1\r\n\r\n3\
                             GET /keys?pattern=a* HTTP/1.1\r\n\r\n";
        let out = exchange(handler(None), input).await;
        let json_start = out.rfind('[').unwrap();
        let keys: Vec<String> = serde_json::from_str(&out[json_start..]).unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&"a".to_string()));
        assert!(keys.contains(&"ab".to_string()));
    }

    #[tokio::test]
    async fn test_bearer_auth() {
        let out = exchange(handler(Some("tok")), b"GET /k HTTP/1.1\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 401 Unauthorized\r\n"));

        let input: &[u8] = b"GET /k HTTP/1.1\r\nAuthorization: Bearer tok\r\n\r\n";
        let out = exchange(handler(Some("tok")), input).await;
        assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
    }

    #[tokio::test]
    async fn test_method_not_allowed() {
        let out = exchange(handler(None), b"PATCH /k HTTP/1.1\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
    }

    #[tokio::test]
    async fn test_connection_close() {
        let input: &[u8] = b"GET /stats HTTP/1.1\r\nConnection: close\r\n\r\n\
                             GET /stats HTTP/1.1\r\n\r\n";
        let out = exchange(handler(None), input).await;
        // Only the first request is answered.
        assert_eq!(out.matches("HTTP/1.1 200 OK").count(), 1);
    }

    #[test]
    fn test_percent_decode() {
        assert_eq!(percent_decode("plain"), "plain");
        assert_eq!(percent_decode("a%2Ab"), "a*b");
        assert_eq!(percent_decode("a%3F"), "a?");
        assert_eq!(percent_decode("bad%2"), "bad%2");
    }
}
