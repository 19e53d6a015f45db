//! RESP Command Handler
//!
//! The reference dialect: a read-execute-respond loop over the command
//! parser, dispatching to the cache. Incoming bytes accumulate in a
//! `BytesMut` buffer because TCP is a stream: a read may carry half a
//! command or a pipelined batch of them, and the loop drains every
//! complete command before asking the socket for more.
//!
//! ## Authentication
//!
//! When a password is configured the session starts unauthenticated and
//! only `AUTH` and `PING` are accepted; everything else is refused with
//! `-NOAUTH` until a successful `AUTH`.

use super::parser::parse_command;
use super::reply::Reply;
use crate::cache::{now_nanos, Cache, StoreOptions};
use crate::protocol::glob::glob_match;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

const INITIAL_BUFFER_SIZE: usize = 4096;

/// Handles RESP connections against a shared cache.
#[derive(Clone)]
pub struct RespHandler {
    cache: Arc<Cache>,
    auth: Option<String>,
}

impl RespHandler {
    pub fn new(cache: Arc<Cache>, auth: Option<String>) -> Self {
        Self { cache, auth }
    }

    /// Runs the connection until the peer disconnects, a fatal protocol
    /// error occurs, or the client sends `QUIT`.
    pub async fn handle<S>(&self, mut stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buffer = BytesMut::with_capacity(INITIAL_BUFFER_SIZE);
        let mut out = BytesMut::with_capacity(INITIAL_BUFFER_SIZE);
        let mut authenticated = self.auth.is_none();

        loop {
            // Drain every complete command already buffered.
            loop {
                match parse_command(&buffer) {
                    Ok(Some((args, consumed))) => {
                        let _ = buffer.split_to(consumed);
                        if args.is_empty() {
                            continue;
                        }

                        let quit = args[0].eq_ignore_ascii_case(b"QUIT");
                        let reply = self.execute(&args, &mut authenticated);

                        out.clear();
                        reply.encode(&mut out);
                        if stream.write_all(&out).await.is_err() {
                            return;
                        }
                        if quit {
                            let _ = stream.flush().await;
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        // Framing is broken; answer once and hang up.
                        warn!(error = %e, "RESP parse error");
                        out.clear();
                        Reply::error(format!("ERR Protocol error: {}", e)).encode(&mut out);
                        let _ = stream.write_all(&out).await;
                        let _ = stream.flush().await;
                        return;
                    }
                }
            }

            match stream.read_buf(&mut buffer).await {
                Ok(0) => return,
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "Connection read error");
                    return;
                }
            }
        }
    }

    fn execute(&self, args: &[Bytes], authenticated: &mut bool) -> Reply {
        let name = args[0].to_ascii_uppercase();

        if !*authenticated && name != b"AUTH" && name != b"PING" {
            return Reply::error("NOAUTH Authentication required");
        }

        match name.as_slice() {
            b"AUTH" => self.cmd_auth(args, authenticated),
            b"PING" => match args.len() {
                1 => Reply::pong(),
                2 => Reply::Bulk(args[1].clone()),
                _ => Reply::wrong_args("ping"),
            },
            b"ECHO" => match args.len() {
                2 => Reply::Bulk(args[1].clone()),
                _ => Reply::wrong_args("echo"),
            },
            b"GET" => self.cmd_get(args),
            b"SET" => self.cmd_set(args),
            b"DEL" => self.cmd_del(args),
            b"EXISTS" => self.cmd_exists(args),
            b"INCR" => self.cmd_incr_fixed(args, 1),
            b"DECR" => self.cmd_incr_fixed(args, -1),
            b"INCRBY" => self.cmd_incr_by(args, 1),
            b"DECRBY" => self.cmd_incr_by(args, -1),
            b"MGET" => self.cmd_mget(args),
            b"MSET" => self.cmd_mset(args),
            b"EXPIRE" => self.cmd_expire(args),
            b"TTL" => self.cmd_ttl(args),
            b"KEYS" => self.cmd_keys(args),
            b"FLUSHDB" | b"FLUSHALL" => {
                self.cache.clear();
                Reply::ok()
            }
            b"DBSIZE" => Reply::Integer(self.cache.num_items() as i64),
            b"INFO" => self.cmd_info(),
            b"SELECT" => Reply::ok(),
            b"QUIT" => Reply::ok(),
            _ => Reply::error(format!(
                "ERR unknown command '{}'",
                String::from_utf8_lossy(&args[0])
            )),
        }
    }

    fn cmd_auth(&self, args: &[Bytes], authenticated: &mut bool) -> Reply {
        if args.len() != 2 {
            return Reply::wrong_args("auth");
        }
        match &self.auth {
            Some(password) if password.as_bytes() == &args[1][..] => {
                *authenticated = true;
                Reply::ok()
            }
            Some(_) => Reply::error("ERR invalid password"),
            None => Reply::error("ERR Client sent AUTH, but no password is set"),
        }
    }

    fn cmd_get(&self, args: &[Bytes]) -> Reply {
        if args.len() != 2 {
            return Reply::wrong_args("get");
        }
        match self.cache.load(&args[1]) {
            Some(entry) => Reply::Bulk(entry.value()),
            None => Reply::Nil,
        }
    }

    /// SET key value [EX seconds] [PX milliseconds] [NX|XX]
    fn cmd_set(&self, args: &[Bytes]) -> Reply {
        if args.len() < 3 {
            return Reply::wrong_args("set");
        }

        let mut opts = StoreOptions::default();
        let mut nx = false;
        let mut xx = false;

        let mut i = 3;
        while i < args.len() {
            match args[i].to_ascii_uppercase().as_slice() {
                b"EX" => {
                    i += 1;
                    match args.get(i).and_then(parse_i64) {
                        Some(secs) if secs > 0 => opts.ttl = Some(Duration::from_secs(secs as u64)),
                        _ => return Reply::error("ERR invalid expire time in 'set' command"),
                    }
                }
                b"PX" => {
                    i += 1;
                    match args.get(i).and_then(parse_i64) {
                        Some(ms) if ms > 0 => opts.ttl = Some(Duration::from_millis(ms as u64)),
                        _ => return Reply::error("ERR invalid expire time in 'set' command"),
                    }
                }
                b"NX" => nx = true,
                b"XX" => xx = true,
                _ => return Reply::error("ERR syntax error"),
            }
            i += 1;
        }

        if nx && self.cache.load(&args[1]).is_some() {
            return Reply::Nil;
        }
        if xx && self.cache.load(&args[1]).is_none() {
            return Reply::Nil;
        }

        self.cache.store(args[1].clone(), args[2].clone(), Some(&opts));
        Reply::ok()
    }

    fn cmd_del(&self, args: &[Bytes]) -> Reply {
        if args.len() < 2 {
            return Reply::wrong_args("del");
        }
        let deleted = args[1..].iter().filter(|key| self.cache.delete(key)).count();
        Reply::Integer(deleted as i64)
    }

    fn cmd_exists(&self, args: &[Bytes]) -> Reply {
        if args.len() < 2 {
            return Reply::wrong_args("exists");
        }
        let found = args[1..]
            .iter()
            .filter(|key| self.cache.load(key).is_some())
            .count();
        Reply::Integer(found as i64)
    }

    /// INCR/DECR: delta fixed at ±1.
    fn cmd_incr_fixed(&self, args: &[Bytes], sign: i64) -> Reply {
        if args.len() != 2 {
            return Reply::wrong_args(if sign > 0 { "incr" } else { "decr" });
        }
        Reply::Integer(self.cache.increment(&args[1], sign))
    }

    /// INCRBY/DECRBY: delta from the wire, negated for DECRBY.
    fn cmd_incr_by(&self, args: &[Bytes], sign: i64) -> Reply {
        if args.len() != 3 {
            return Reply::wrong_args(if sign > 0 { "incrby" } else { "decrby" });
        }
        match parse_i64(&args[2]) {
            Some(delta) => Reply::Integer(self.cache.increment(&args[1], sign * delta)),
            None => Reply::error("ERR value is not an integer or out of range"),
        }
    }

    fn cmd_mget(&self, args: &[Bytes]) -> Reply {
        if args.len() < 2 {
            return Reply::wrong_args("mget");
        }
        Reply::Array(
            args[1..]
                .iter()
                .map(|key| match self.cache.load(key) {
                    Some(entry) => Reply::Bulk(entry.value()),
                    None => Reply::Nil,
                })
                .collect(),
        )
    }

    fn cmd_mset(&self, args: &[Bytes]) -> Reply {
        if args.len() < 3 || args.len() % 2 == 0 {
            return Reply::wrong_args("mset");
        }
        for pair in args[1..].chunks_exact(2) {
            self.cache.store(pair[0].clone(), pair[1].clone(), None);
        }
        Reply::ok()
    }

    fn cmd_expire(&self, args: &[Bytes]) -> Reply {
        if args.len() != 3 {
            return Reply::wrong_args("expire");
        }
        let Some(seconds) = parse_i64(&args[2]) else {
            return Reply::error("ERR value is not an integer or out of range");
        };

        match self.cache.load(&args[1]) {
            Some(entry) => {
                entry.set_expire_at(now_nanos().saturating_add(seconds.saturating_mul(1_000_000_000)));
                Reply::Integer(1)
            }
            None => Reply::Integer(0),
        }
    }

    fn cmd_ttl(&self, args: &[Bytes]) -> Reply {
        if args.len() != 2 {
            return Reply::wrong_args("ttl");
        }
        match self.cache.load(&args[1]) {
            None => Reply::Integer(-2),
            Some(entry) => {
                let expire_at = entry.expire_at();
                if expire_at == 0 {
                    Reply::Integer(-1)
                } else {
                    Reply::Integer(((expire_at - now_nanos()) / 1_000_000_000).max(0))
                }
            }
        }
    }

    fn cmd_keys(&self, args: &[Bytes]) -> Reply {
        if args.len() != 2 {
            return Reply::wrong_args("keys");
        }
        let mut keys = Vec::new();
        self.cache.iterate(|entry| {
            if glob_match(&args[1], entry.key()) {
                keys.push(Reply::Bulk(entry.key().clone()));
            }
            true
        });
        Reply::Array(keys)
    }

    fn cmd_info(&self) -> Reply {
        let stats = self.cache.stats();
        let info = format!(
            "# Server\r\n\
             redis_version:7.0.0\r\n\
             redis_mode:standalone\r\n\
             process_id:1\r\n\
             tcp_port:6379\r\n\
             \r\n\
             # Keyspace\r\n\
             db0:keys={},expires=0\r\n\
             \r\n\
             # Stats\r\n\
             total_commands_processed:{}\r\n\
             keyspace_hits:{}\r\n\
             keyspace_misses:{}\r\n\
             evicted_keys:{}\r\n\
             expired_keys:{}\r\n\
             \r\n\
             # Memory\r\n\
             used_memory:{}\r\n\
             used_memory_human:{}\r\n",
            stats.num_items,
            stats.num_ops,
            stats.num_hits,
            stats.num_misses,
            stats.num_evicted,
            stats.num_expired,
            stats.mem_used,
            format_memory(stats.mem_used),
        );
        Reply::bulk(info)
    }
}

fn parse_i64(arg: &Bytes) -> Option<i64> {
    std::str::from_utf8(arg).ok()?.parse().ok()
}

/// Human-readable byte count: `512B`, `1.5KB`, `2.0MB`, ...
fn format_memory(bytes: i64) -> String {
    const UNIT: i64 = 1024;
    if bytes < UNIT {
        return format!("{}B", bytes);
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    format!("{:.1}{}B", bytes as f64 / div as f64, b"KMGTPE"[exp] as char)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn handler(auth: Option<&str>) -> RespHandler {
        RespHandler::new(Arc::new(Cache::new(16, 0)), auth.map(String::from))
    }

    /// Feeds `input` to a fresh session and returns everything the
    /// handler wrote back.
    async fn exchange(handler: RespHandler, input: &[u8]) -> Vec<u8> {
        let (mut client, server) = duplex(64 * 1024);
        let task = tokio::spawn(async move { handler.handle(server).await });

        client.write_all(input).await.unwrap();
        client.shutdown().await.unwrap();

        let mut output = Vec::new();
        client.read_to_end(&mut output).await.unwrap();
        task.await.unwrap();
        output
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let out = exchange(
            handler(None),
            b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n*2\r\n$3\r\nGET\r\n$1\r\nk\r\n",
        )
        .await;
        assert_eq!(out, b"+OK\r\n$1\r\nv\r\n");
    }

    #[tokio::test]
    async fn test_get_missing_is_nil() {
        let out = exchange(handler(None), b"*2\r\n$3\r\nGET\r\n$4\r\nnope\r\n").await;
        assert_eq!(out, b"$-1\r\n");
    }

    #[tokio::test]
    async fn test_ping_and_echo() {
        let out = exchange(handler(None), b"*1\r\n$4\r\nPING\r\n").await;
        assert_eq!(out, b"+PONG\r\n");

        let out = exchange(handler(None), b"*2\r\n$4\r\nPING\r\n$2\r\nhi\r\n").await;
        assert_eq!(out, b"$2\r\nhi\r\n");

        let out = exchange(handler(None), b"*2\r\n$4\r\nECHO\r\n$5\r\nhello\r\n").await;
        assert_eq!(out, b"$5\r\nhello\r\n");
    }

    #[tokio::test]
    async fn test_inline_command() {
        let out = exchange(handler(None), b"PING\r\n").await;
        assert_eq!(out, b"+PONG\r\n");

        let out = exchange(handler(None), b"SET k v\r\nGET k\r\n").await;
        assert_eq!(out, b"+OK\r\n$1\r\nv\r\n");
    }

    #[tokio::test]
    async fn test_unknown_command_and_arity() {
        let out = exchange(handler(None), b"*1\r\n$5\r\nBOGUS\r\n").await;
        assert_eq!(out, b"-ERR unknown command 'BOGUS'\r\n");

        let out = exchange(handler(None), b"*1\r\n$3\r\nGET\r\n").await;
        assert_eq!(out, b"-ERR wrong number of arguments for 'get' command\r\n");
    }

    #[tokio::test]
    async fn test_auth_gate() {
        let input: &[u8] = b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n\
                             *1\r\n$4\r\nPING\r\n\
                             *2\r\n$4\r\nAUTH\r\n$5\r\nwrong\r\n\
                             *2\r\n$4\r\nAUTH\r\n$6\r\nsecret\r\n\
                             *2\r\n$3\r\nGET\r\n$1\r\nk\r\n";
        let out = exchange(handler(Some("secret")), input).await;
        assert_eq!(
            out,
            &b"-NOAUTH Authentication required\r\n\
               +PONG\r\n\
               -ERR invalid password\r\n\
               +OK\r\n\
               $-1\r\n"[..]
        );
    }

    #[tokio::test]
    async fn test_auth_without_password_configured() {
        let out = exchange(handler(None), b"*2\r\n$4\r\nAUTH\r\n$2\r\npw\r\n").await;
        assert_eq!(out, b"-ERR Client sent AUTH, but no password is set\r\n");
    }

    #[tokio::test]
    async fn test_incr_decr() {
        let input: &[u8] = b"*2\r\n$4\r\nINCR\r\n$1\r\nc\r\n\
                             *3\r\n$6\r\nINCRBY\r\n$1\r\nc\r\n$2\r\n10\r\n\
                             *2\r\n$4\r\nDECR\r\n$1\r\nc\r\n\
                             *3\r\n$6\r\nDECRBY\r\n$1\r\nc\r\n$1\r\n4\r\n";
        let out = exchange(handler(None), input).await;
        assert_eq!(out, b":1\r\n:11\r\n:10\r\n:6\r\n");

        let out = exchange(
            handler(None),
            b"*3\r\n$6\r\nINCRBY\r\n$1\r\nc\r\n$3\r\nabc\r\n",
        )
        .await;
        assert_eq!(out, b"-ERR value is not an integer or out of range\r\n");
    }

    #[tokio::test]
    async fn test_del_and_exists_variadic() {
        let input: &[u8] = b"*5\r\n$4\r\nMSET\r\n$1\r\na\r\n$1\r\n1\r\n$1\r\nb\r\n$1\r\n2\r\n\
                             *4\r\n$6\r\nEXISTS\r\n$1\r\na\r\n$1\r\nb\r\n$1\r\nc\r\n\
                             *4\r\n$3\r\nDEL\r\n$1\r\na\r\n$1\r\nb\r\n$1\r\nc\r\n\
                             *2\r\n$6\r\nEXISTS\r\n$1\r\na\r\n";
        let out = exchange(handler(None), input).await;
        assert_eq!(out, b"+OK\r\n:2\r\n:2\r\n:0\r\n");
    }

    #[tokio::test]
    async fn test_mget() {
        let input: &[u8] = b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$2\r\nv1\r\n\
                             *4\r\n$4\r\nMGET\r\n$1\r\na\r\n$1\r\nx\r\n$1\r\na\r\n";
        let out = exchange(handler(None), input).await;
        assert_eq!(out, b"+OK\r\n*3\r\n$2\r\nv1\r\n$-1\r\n$2\r\nv1\r\n");
    }

    #[tokio::test]
    async fn test_set_nx_xx() {
        let input: &[u8] = b"*4\r\n$3\r\nSET\r\n$1\r\nk\r\n$2\r\nv1\r\n$2\r\nNX\r\n\
                             *4\r\n$3\r\nSET\r\n$1\r\nk\r\n$2\r\nv2\r\n$2\r\nNX\r\n\
                             *4\r\n$3\r\nSET\r\n$1\r\nm\r\n$2\r\nv3\r\n$2\r\nXX\r\n\
                             *2\r\n$3\r\nGET\r\n$1\r\nk\r\n";
        let out = exchange(handler(None), input).await;
        assert_eq!(out, b"+OK\r\n$-1\r\n$-1\r\n$2\r\nv1\r\n");
    }

    #[tokio::test]
    async fn test_ttl_and_expire() {
        let input: &[u8] = b"*5\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n$2\r\nEX\r\n$3\r\n100\r\n\
                             *2\r\n$3\r\nTTL\r\n$1\r\nk\r\n\
                             *2\r\n$3\r\nTTL\r\n$7\r\nmissing\r\n";
        let out = exchange(handler(None), input).await;
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.split("\r\n");
        assert_eq!(lines.next(), Some("+OK"));
        let ttl: i64 = lines.next().unwrap().trim_start_matches(':').parse().unwrap();
        assert!(ttl > 0 && ttl <= 100);
        assert_eq!(lines.next(), Some(":-2"));

        let input: &[u8] = b"*3\r\n$3\r\nSET\r\n$1\r\np\r\n$1\r\nv\r\n\
                             *2\r\n$3\r\nTTL\r\n$1\r\np\r\n\
                             *3\r\n$6\r\nEXPIRE\r\n$1\r\np\r\n$2\r\n50\r\n\
                             *3\r\n$6\r\nEXPIRE\r\n$7\r\nmissing\r\n$2\r\n50\r\n";
        let out = exchange(handler(None), input).await;
        assert_eq!(out, b"+OK\r\n:-1\r\n:1\r\n:0\r\n");
    }

    #[tokio::test]
    async fn test_keys_glob() {
        let seed: &[u8] = b"*7\r\n$4\r\nMSET\r\n$1\r\na\r\n$1\r\n1\r\n$2\r\nab\r\n$1\r\n2\r\n$3\r\nabc\r\n$1\r\n3\r\n";

        let mut input = seed.to_vec();
        input.extend_from_slice(b"*2\r\n$4\r\nKEYS\r\n$2\r\na*\r\n");
        let out = exchange(handler(None), &input).await;
        let text = String::from_utf8_lossy(&out);
        assert!(text.starts_with("+OK\r\n*3\r\n"));

        let mut input = seed.to_vec();
        input.extend_from_slice(b"*2\r\n$4\r\nKEYS\r\n$2\r\na?\r\n");
        let out = exchange(handler(None), &input).await;
        assert_eq!(out, b"+OK\r\n*1\r\n$2\r\nab\r\n");
    }

    #[tokio::test]
    async fn test_dbsize_and_flush() {
        let input: &[u8] = b"*5\r\n$4\r\nMSET\r\n$1\r\na\r\n$1\r\n1\r\n$1\r\nb\r\n$1\r\n2\r\n\
                             *1\r\n$6\r\nDBSIZE\r\n\
                             *1\r\n$7\r\nFLUSHDB\r\n\
                             *1\r\n$6\r\nDBSIZE\r\n";
        let out = exchange(handler(None), input).await;
        assert_eq!(out, b"+OK\r\n:2\r\n+OK\r\n:0\r\n");
    }

    #[tokio::test]
    async fn test_select_and_quit() {
        let input: &[u8] = b"*2\r\n$6\r\nSELECT\r\n$1\r\n0\r\n\
                             *1\r\n$4\r\nQUIT\r\n\
                             *1\r\n$4\r\nPING\r\n";
        let out = exchange(handler(None), input).await;
        // QUIT closes the session; the trailing PING is never answered.
        assert_eq!(out, b"+OK\r\n+OK\r\n");
    }

    #[tokio::test]
    async fn test_info_contains_stats() {
        let out = exchange(handler(None), b"*1\r\n$4\r\nINFO\r\n").await;
        let text = String::from_utf8_lossy(&out);
        assert!(text.starts_with("$"));
        assert!(text.contains("# Stats"));
        assert!(text.contains("keyspace_hits:0"));
        assert!(text.contains("used_memory:0"));
    }

    #[test]
    fn test_format_memory() {
        assert_eq!(format_memory(512), "512B");
        assert_eq!(format_memory(2048), "2.0KB");
        assert_eq!(format_memory(3 * 1024 * 1024 / 2), "1.5MB");
        assert_eq!(format_memory(5 * 1024 * 1024 * 1024), "5.0GB");
    }
}
