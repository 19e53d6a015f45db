//! Postgres-Wire Dialect
//!
//! Speaks enough of the Postgres frontend/backend protocol for `psql`
//! and driver libraries to connect and run naive single-table queries.
//! Keys live in a virtual table namespace: `SELECT ... FROM users WHERE
//! k = 'alice'` reads the cache key `USERS:ALICE` (the whole query is
//! uppercased before parsing, as a naive SQL normalizer).
//!
//! Supported frames: startup (protocol 196608), optional cleartext
//! password authentication, simple query `Q`, terminate `X`. Responses
//! use AuthenticationOk/CleartextPassword (`R`), ErrorResponse (`E`),
//! RowDescription (`T`, text OID), DataRow (`D`), CommandComplete (`C`)
//! and ReadyForQuery (`Z`).

use crate::cache::{Cache, StoreOptions};
use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Protocol version 3.0, big-endian, as sent in the startup packet.
const PROTOCOL_VERSION: u32 = 196_608;

/// Text type OID used for every column we describe.
const TEXT_OID: i32 = 25;

/// Handles Postgres-wire connections against a shared cache.
#[derive(Clone)]
pub struct PostgresHandler {
    cache: Arc<Cache>,
    auth: Option<String>,
}

impl PostgresHandler {
    pub fn new(cache: Arc<Cache>, auth: Option<String>) -> Self {
        Self { cache, auth }
    }

    pub async fn handle<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if let Err(e) = self.session(stream).await {
            debug!(error = %e, "Postgres connection ended with error");
        }
    }

    async fn session<S>(&self, mut stream: S) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.startup(&mut stream).await?;

        let mut authenticated = self.auth.is_none();
        let mut out = BytesMut::with_capacity(1024);

        loop {
            let (msg_type, data) = match read_message(&mut stream).await {
                Ok(message) => message,
                Err(_) => return Ok(()),
            };

            out.clear();

            if !authenticated && msg_type != b'p' {
                put_error(&mut out, "28P01", "authentication required");
                stream.write_all(&out).await?;
                continue;
            }

            match msg_type {
                b'p' => {
                    let password = trim_nul(&data);
                    if self.auth.as_deref().map(str::as_bytes) == Some(password) {
                        authenticated = true;
                        put_authentication_ok(&mut out);
                        put_ready_for_query(&mut out);
                    } else {
                        put_error(&mut out, "28P01", "authentication failed");
                    }
                }
                b'Q' => {
                    let query = String::from_utf8_lossy(trim_nul(&data)).into_owned();
                    self.run_query(&mut out, &query);
                    put_ready_for_query(&mut out);
                }
                b'X' => return Ok(()),
                _ => put_error(&mut out, "08P01", "unsupported message type"),
            }

            stream.write_all(&out).await?;
            stream.flush().await?;
        }
    }

    async fn startup<S>(&self, stream: &mut S) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut header = [0u8; 8];
        stream.read_exact(&mut header).await?;

        let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let version = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if version != PROTOCOL_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported protocol version: {}", version),
            ));
        }

        // Remaining startup parameters (user, database, ...) are ignored.
        let mut params = vec![0u8; (length as usize).saturating_sub(8)];
        stream.read_exact(&mut params).await?;

        let mut out = BytesMut::with_capacity(64);
        if self.auth.is_some() {
            put_authentication_cleartext_password(&mut out);
        } else {
            put_authentication_ok(&mut out);
            put_ready_for_query(&mut out);
        }
        stream.write_all(&out).await?;
        stream.flush().await
    }

    fn run_query(&self, out: &mut BytesMut, query: &str) {
        let query = query.trim().to_uppercase();

        if query.starts_with("SELECT ") {
            self.query_select(out, &query);
        } else if query.starts_with("INSERT ") {
            self.query_insert(out, &query);
        } else if query.starts_with("UPDATE ") {
            self.query_update(out, &query);
        } else if query.starts_with("DELETE ") {
            self.query_delete(out, &query);
        } else {
            put_error(out, "42601", "syntax error");
        }
    }

    /// `SELECT <cols> FROM <table> [WHERE <col> = '<key>']`
    fn query_select(&self, out: &mut BytesMut, query: &str) {
        let parts: Vec<&str> = query.split_whitespace().collect();
        if parts.len() < 4 || parts[2] != "FROM" {
            return put_error(out, "42601", "syntax error");
        }
        let table = parts[3];

        let key = where_key(&parts);

        match key {
            None => {
                // Full virtual-table scan.
                put_row_description(out, &["key", "value"]);
                let prefix = format!("{}:", table);
                let mut count = 0;
                self.cache.iterate(|entry| {
                    if entry.key().starts_with(prefix.as_bytes()) {
                        let value = entry.value();
                        put_data_row(out, &[&entry.key()[..], &value[..]]);
                        count += 1;
                    }
                    true
                });
                put_command_complete(out, &format!("SELECT {}", count));
            }
            Some(key) => {
                let full_key = format!("{}:{}", table, key);
                put_row_description(out, &["key", "value"]);
                match self.cache.load(full_key.as_bytes()) {
                    Some(entry) => {
                        let value = entry.value();
                        put_data_row(out, &[key.as_bytes(), &value[..]]);
                        put_command_complete(out, "SELECT 1");
                    }
                    None => put_command_complete(out, "SELECT 0"),
                }
            }
        }
    }

    /// `INSERT INTO <table> ... VALUES ('<key>', '<value>')`
    fn query_insert(&self, out: &mut BytesMut, query: &str) {
        let parts: Vec<&str> = query.split_whitespace().collect();
        if parts.len() < 5 || parts[1] != "INTO" {
            return put_error(out, "42601", "syntax error");
        }
        let table = parts[2];

        let Some(values_idx) = parts.iter().position(|p| *p == "VALUES") else {
            return put_error(out, "42601", "syntax error");
        };
        if values_idx + 1 >= parts.len() {
            return put_error(out, "42601", "syntax error");
        }

        let values = parts[values_idx + 1..].join(" ");
        let values = values.trim_matches(|c| c == '(' || c == ')');
        let fields: Vec<&str> = values.split(',').collect();
        if fields.len() < 2 {
            return put_error(out, "42601", "syntax error");
        }

        let key = trim_sql_value(fields[0]);
        let value = trim_sql_value(fields[1]);

        let full_key = format!("{}:{}", table, key);
        self.cache.store(
            Bytes::from(full_key),
            Bytes::copy_from_slice(value.as_bytes()),
            None,
        );

        put_command_complete(out, "INSERT 0 1");
    }

    /// `UPDATE <table> SET <col> = '<value>' WHERE <col> = '<key>'`
    fn query_update(&self, out: &mut BytesMut, query: &str) {
        let parts: Vec<&str> = query.split_whitespace().collect();
        if parts.len() < 6 || parts[2] != "SET" {
            return put_error(out, "42601", "syntax error");
        }
        let table = parts[1];

        let Some(where_idx) = parts.iter().position(|p| *p == "WHERE") else {
            return put_error(out, "42601", "syntax error");
        };
        let Some(key) = where_key(&parts) else {
            return put_error(out, "42601", "syntax error");
        };

        let assignment = parts[3..where_idx].join(" ");
        let Some((_, value)) = assignment.split_once('=') else {
            return put_error(out, "42601", "syntax error");
        };
        let value = trim_sql_value(value);

        let full_key = format!("{}:{}", table, key);
        match self.cache.load(full_key.as_bytes()) {
            Some(entry) => {
                let opts = StoreOptions {
                    flags: entry.flags(),
                    ..Default::default()
                };
                self.cache.store(
                    Bytes::from(full_key),
                    Bytes::copy_from_slice(value.as_bytes()),
                    Some(&opts),
                );
                put_command_complete(out, "UPDATE 1");
            }
            None => put_command_complete(out, "UPDATE 0"),
        }
    }

    /// `DELETE FROM <table> WHERE <col> = '<key>'`
    fn query_delete(&self, out: &mut BytesMut, query: &str) {
        let parts: Vec<&str> = query.split_whitespace().collect();
        if parts.len() < 6 || parts[1] != "FROM" {
            return put_error(out, "42601", "syntax error");
        }
        let table = parts[2];

        let Some(key) = where_key(&parts) else {
            return put_error(out, "42601", "syntax error");
        };

        let full_key = format!("{}:{}", table, key);
        if self.cache.delete(full_key.as_bytes()) {
            put_command_complete(out, "DELETE 1");
        } else {
            put_command_complete(out, "DELETE 0");
        }
    }
}

/// Extracts the key from a `WHERE <col> = '<key>'` clause, if present.
fn where_key<'a>(parts: &[&'a str]) -> Option<&'a str> {
    let where_idx = parts.iter().position(|p| *p == "WHERE")?;
    if where_idx + 3 < parts.len() && parts[where_idx + 2] == "=" {
        Some(parts[where_idx + 3].trim_matches(|c| c == '\'' || c == '"'))
    } else {
        None
    }
}

fn trim_sql_value(raw: &str) -> &str {
    raw.trim().trim_matches(|c| c == '\'' || c == '"')
}

fn trim_nul(data: &[u8]) -> &[u8] {
    let end = data.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
    &data[..end]
}

/// Reads one typed message: a tag byte and a big-endian length that
/// includes itself.
async fn read_message<S>(stream: &mut S) -> io::Result<(u8, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 5];
    stream.read_exact(&mut header).await?;

    let msg_type = header[0];
    let length = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    let payload_len = (length as usize).saturating_sub(4);

    let mut data = vec![0u8; payload_len];
    stream.read_exact(&mut data).await?;

    Ok((msg_type, data))
}

fn put_message(out: &mut BytesMut, msg_type: u8, payload: &[u8]) {
    out.put_u8(msg_type);
    out.put_u32(payload.len() as u32 + 4);
    out.put_slice(payload);
}

fn put_authentication_ok(out: &mut BytesMut) {
    put_message(out, b'R', &0u32.to_be_bytes());
}

fn put_authentication_cleartext_password(out: &mut BytesMut) {
    put_message(out, b'R', &3u32.to_be_bytes());
}

fn put_ready_for_query(out: &mut BytesMut) {
    put_message(out, b'Z', b"I");
}

fn put_error(out: &mut BytesMut, code: &str, message: &str) {
    let mut payload = BytesMut::with_capacity(32 + message.len());
    payload.put_u8(b'S');
    payload.put_slice(b"ERROR");
    payload.put_u8(0);
    payload.put_u8(b'C');
    payload.put_slice(code.as_bytes());
    payload.put_u8(0);
    payload.put_u8(b'M');
    payload.put_slice(message.as_bytes());
    payload.put_u8(0);
    payload.put_u8(0);

    put_message(out, b'E', &payload);
}

fn put_row_description(out: &mut BytesMut, columns: &[&str]) {
    let mut payload = BytesMut::with_capacity(32 * columns.len());
    payload.put_i16(columns.len() as i16);

    for column in columns {
        payload.put_slice(column.as_bytes());
        payload.put_u8(0);
        payload.put_i32(0); // table OID
        payload.put_i16(0); // column attribute number
        payload.put_i32(TEXT_OID);
        payload.put_i16(-1); // type length (variable)
        payload.put_i32(-1); // type modifier
        payload.put_i16(0); // text format
    }

    put_message(out, b'T', &payload);
}

fn put_data_row(out: &mut BytesMut, values: &[&[u8]]) {
    let mut payload = BytesMut::with_capacity(16 + values.iter().map(|v| v.len()).sum::<usize>());
    payload.put_i16(values.len() as i16);

    for value in values {
        payload.put_i32(value.len() as i32);
        payload.put_slice(value);
    }

    put_message(out, b'D', &payload);
}

fn put_command_complete(out: &mut BytesMut, tag: &str) {
    let mut payload = BytesMut::with_capacity(tag.len() + 1);
    payload.put_slice(tag.as_bytes());
    payload.put_u8(0);

    put_message(out, b'C', &payload);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn handler(auth: Option<&str>) -> PostgresHandler {
        PostgresHandler::new(Arc::new(Cache::new(16, 0)), auth.map(String::from))
    }

    fn startup_packet() -> Vec<u8> {
        let mut packet = Vec::new();
        packet.extend_from_slice(&8u32.to_be_bytes());
        packet.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        packet
    }

    fn query_message(sql: &str) -> Vec<u8> {
        let mut message = vec![b'Q'];
        message.extend_from_slice(&(sql.len() as u32 + 5).to_be_bytes());
        message.extend_from_slice(sql.as_bytes());
        message.push(0);
        message
    }

    fn password_message(password: &str) -> Vec<u8> {
        let mut message = vec![b'p'];
        message.extend_from_slice(&(password.len() as u32 + 5).to_be_bytes());
        message.extend_from_slice(password.as_bytes());
        message.push(0);
        message
    }

    /// Splits raw handler output back into (tag, payload) frames.
    fn parse_frames(mut data: &[u8]) -> Vec<(u8, Vec<u8>)> {
        let mut frames = Vec::new();
        while data.len() >= 5 {
            let tag = data[0];
            let length = u32::from_be_bytes([data[1], data[2], data[3], data[4]]) as usize;
            let payload = data[5..1 + length].to_vec();
            frames.push((tag, payload));
            data = &data[1 + length..];
        }
        frames
    }

    async fn exchange(handler: PostgresHandler, input: Vec<u8>) -> Vec<(u8, Vec<u8>)> {
        let (mut client, server) = duplex(64 * 1024);
        let task = tokio::spawn(async move { handler.handle(server).await });

        client.write_all(&input).await.unwrap();
        client.shutdown().await.unwrap();

        let mut output = Vec::new();
        client.read_to_end(&mut output).await.unwrap();
        task.await.unwrap();
        parse_frames(&output)
    }

    #[tokio::test]
    async fn test_startup_without_auth() {
        let frames = exchange(handler(None), startup_packet()).await;
        assert_eq!(frames[0], (b'R', 0u32.to_be_bytes().to_vec()));
        assert_eq!(frames[1], (b'Z', b"I".to_vec()));
    }

    #[tokio::test]
    async fn test_insert_select_roundtrip() {
        let mut input = startup_packet();
        input.extend(query_message("INSERT INTO users VALUES ('alice', 'admin')"));
        input.extend(query_message("SELECT v FROM users WHERE k = 'alice'"));

        let frames = exchange(handler(None), input).await;
        let tags: Vec<u8> = frames.iter().map(|(t, _)| *t).collect();
        // R Z | C Z | T D C Z
        assert_eq!(tags, vec![b'R', b'Z', b'C', b'Z', b'T', b'D', b'C', b'Z']);

        assert_eq!(frames[2].1, b"INSERT 0 1\0".to_vec());

        // DataRow: 2 columns, key then value (both uppercased by the
        // naive normalizer).
        let row = &frames[5].1;
        assert_eq!(&row[..2], &2i16.to_be_bytes());
        let body = &row[2..];
        assert_eq!(&body[..4], &5i32.to_be_bytes());
        assert_eq!(&body[4..9], b"ALICE");
        assert_eq!(frames[6].1, b"SELECT 1\0".to_vec());
    }

    #[tokio::test]
    async fn test_select_miss() {
        let mut input = startup_packet();
        input.extend(query_message("SELECT v FROM users WHERE k = 'ghost'"));

        let frames = exchange(handler(None), input).await;
        assert_eq!(frames[2].0, b'T');
        assert_eq!(frames[3].1, b"SELECT 0\0".to_vec());
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let mut input = startup_packet();
        input.extend(query_message("INSERT INTO t VALUES ('k', 'v1')"));
        input.extend(query_message("UPDATE t SET v = 'v2' WHERE k = 'k'"));
        input.extend(query_message("UPDATE t SET v = 'x' WHERE k = 'ghost'"));
        input.extend(query_message("DELETE FROM t WHERE k = 'k'"));
        input.extend(query_message("DELETE FROM t WHERE k = 'k'"));

        let frames = exchange(handler(None), input).await;
        let completes: Vec<&[u8]> = frames
            .iter()
            .filter(|(t, _)| *t == b'C')
            .map(|(_, p)| p.as_slice())
            .collect();
        assert_eq!(
            completes,
            vec![
                &b"INSERT 0 1\0"[..],
                &b"UPDATE 1\0"[..],
                &b"UPDATE 0\0"[..],
                &b"DELETE 1\0"[..],
                &b"DELETE 0\0"[..],
            ]
        );
    }

    #[tokio::test]
    async fn test_syntax_error() {
        let mut input = startup_packet();
        input.extend(query_message("DROP TABLE users"));

        let frames = exchange(handler(None), input).await;
        assert_eq!(frames[2].0, b'E');
        let payload = String::from_utf8_lossy(&frames[2].1).into_owned();
        assert!(payload.contains("42601"));
        // The session continues: ReadyForQuery follows the error.
        assert_eq!(frames[3].0, b'Z');
    }

    #[tokio::test]
    async fn test_cleartext_auth_flow() {
        let mut input = startup_packet();
        input.extend(query_message("SELECT v FROM t WHERE k = 'x'"));

        // Unauthenticated query is refused.
        let frames = exchange(handler(Some("pw")), input).await;
        assert_eq!(frames[0], (b'R', 3u32.to_be_bytes().to_vec()));
        assert_eq!(frames[1].0, b'E');

        // Correct password unlocks the session.
        let mut input = startup_packet();
        input.extend(password_message("pw"));
        input.extend(query_message("SELECT v FROM t WHERE k = 'x'"));
        let frames = exchange(handler(Some("pw")), input).await;
        let tags: Vec<u8> = frames.iter().map(|(t, _)| *t).collect();
        assert_eq!(tags, vec![b'R', b'R', b'Z', b'T', b'C', b'Z']);

        // Wrong password is an authentication failure.
        let mut input = startup_packet();
        input.extend(password_message("nope"));
        let frames = exchange(handler(Some("pw")), input).await;
        assert_eq!(frames[1].0, b'E');
    }

    #[tokio::test]
    async fn test_terminate() {
        let mut input = startup_packet();
        input.extend(vec![b'X', 0, 0, 0, 4]);
        input.extend(query_message("SELECT v FROM t WHERE k = 'x'"));

        let frames = exchange(handler(None), input).await;
        // Only the startup response; the query after X is never seen.
        assert_eq!(frames.len(), 2);
    }

    #[tokio::test]
    async fn test_full_table_scan() {
        let mut input = startup_packet();
        input.extend(query_message("INSERT INTO pets VALUES ('rex', 'dog')"));
        input.extend(query_message("INSERT INTO pets VALUES ('tom', 'cat')"));
        input.extend(query_message("INSERT INTO houses VALUES ('hq', 'red')"));
        input.extend(query_message("SELECT * FROM pets"));

        let frames = exchange(handler(None), input).await;
        let data_rows = frames.iter().filter(|(t, _)| *t == b'D').count();
        assert_eq!(data_rows, 2);
        let select_tag = frames
            .iter()
            .rev()
            .find(|(t, _)| *t == b'C')
            .map(|(_, p)| p.clone());
        assert_eq!(select_tag, Some(b"SELECT 2\0".to_vec()));
    }
}
