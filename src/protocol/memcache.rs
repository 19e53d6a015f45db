//! Memcache Text Dialect
//!
//! A line-oriented adapter over the same cache operations the RESP
//! handler uses. Storage commands carry a data block after the command
//! line (`<cmd> <key> <flags> <exptime> <bytes> [noreply]\r\n<data>\r\n`);
//! retrievals answer with `VALUE` lines and an `END` terminator.
//!
//! `exptime` follows the memcached convention: values below 2 592 000
//! (30 days) are relative seconds, anything larger is an absolute Unix
//! timestamp. `noreply` suppresses the response line.

use crate::cache::{now_nanos, Cache, StoreOptions};
use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

/// Relative/absolute pivot for exptime values, per the memcached text
/// protocol (30 days in seconds).
const EXPTIME_ABSOLUTE_CUTOFF: i64 = 2_592_000;

/// Handles memcache-text connections against a shared cache.
#[derive(Clone)]
pub struct MemcacheHandler {
    cache: Arc<Cache>,
}

impl MemcacheHandler {
    pub fn new(cache: Arc<Cache>) -> Self {
        Self { cache }
    }

    pub async fn handle<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);

        if let Err(e) = self.session(&mut reader, &mut writer).await {
            debug!(error = %e, "Memcache connection ended with error");
        }
    }

    async fn session<R, W>(&self, reader: &mut R, writer: &mut W) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut line = Vec::with_capacity(256);
        let mut out = BytesMut::with_capacity(1024);

        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line).await? == 0 {
                return Ok(());
            }

            let parts: Vec<&[u8]> = trim_line(&line)
                .split(|&b| b == b' ')
                .filter(|p| !p.is_empty())
                .collect();
            if parts.is_empty() {
                continue;
            }

            out.clear();
            let mut quit = false;

            match parts[0] {
                b"get" => self.do_get(&mut out, &parts[1..], false),
                b"gets" => self.do_get(&mut out, &parts[1..], true),
                b"set" => self.do_store(reader, &mut out, &parts, false, false).await?,
                b"add" => self.do_store(reader, &mut out, &parts, true, false).await?,
                b"replace" => self.do_store(reader, &mut out, &parts, false, true).await?,
                b"append" => self.do_concat(reader, &mut out, &parts, true).await?,
                b"prepend" => self.do_concat(reader, &mut out, &parts, false).await?,
                b"cas" => self.do_cas(reader, &mut out, &parts).await?,
                b"delete" => self.do_delete(&mut out, &parts),
                b"incr" => self.do_incr(&mut out, &parts, true),
                b"decr" => self.do_incr(&mut out, &parts, false),
                b"touch" => self.do_touch(&mut out, &parts),
                b"flush_all" => {
                    self.cache.clear();
                    out.put_slice(b"OK\r\n");
                }
                b"stats" => self.do_stats(&mut out),
                b"version" => out.put_slice(b"VERSION 1.6.0\r\n"),
                b"quit" => quit = true,
                _ => out.put_slice(b"ERROR\r\n"),
            }

            if !out.is_empty() {
                writer.write_all(&out).await?;
                writer.flush().await?;
            }
            if quit {
                return Ok(());
            }
        }
    }

    fn do_get(&self, out: &mut BytesMut, keys: &[&[u8]], with_cas: bool) {
        for key in keys {
            let Some(entry) = self.cache.load(key) else {
                continue;
            };
            let value = entry.value();

            out.put_slice(b"VALUE ");
            out.put_slice(key);
            if with_cas {
                out.put_slice(
                    format!(" {} {} {}\r\n", entry.flags(), value.len(), entry.cas()).as_bytes(),
                );
            } else {
                out.put_slice(format!(" {} {}\r\n", entry.flags(), value.len()).as_bytes());
            }
            out.put_slice(&value);
            out.put_slice(b"\r\n");
        }
        out.put_slice(b"END\r\n");
    }

    /// set / add / replace.
    async fn do_store<R>(
        &self,
        reader: &mut R,
        out: &mut BytesMut,
        parts: &[&[u8]],
        add_only: bool,
        replace_only: bool,
    ) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let Some((key, flags, exptime, bytes, noreply)) = parse_store_header(parts) else {
            out.put_slice(b"CLIENT_ERROR bad command line format\r\n");
            return Ok(());
        };

        let Some(data) = read_data_block(reader, bytes).await? else {
            out.put_slice(b"CLIENT_ERROR bad data chunk\r\n");
            return Ok(());
        };

        let exists = self.cache.load(&key).is_some();
        if (add_only && exists) || (replace_only && !exists) {
            if !noreply {
                out.put_slice(b"NOT_STORED\r\n");
            }
            return Ok(());
        }

        let opts = StoreOptions {
            ttl: exptime_to_ttl(exptime),
            flags,
            ..Default::default()
        };
        self.cache.store(key, data, Some(&opts));

        if !noreply {
            out.put_slice(b"STORED\r\n");
        }
        Ok(())
    }

    /// append / prepend: concatenate with the stored value, then store
    /// the result back with the entry's existing flags.
    async fn do_concat<R>(
        &self,
        reader: &mut R,
        out: &mut BytesMut,
        parts: &[&[u8]],
        append: bool,
    ) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let Some((key, _, _, bytes, noreply)) = parse_store_header(parts) else {
            out.put_slice(b"CLIENT_ERROR bad command line format\r\n");
            return Ok(());
        };

        let Some(data) = read_data_block(reader, bytes).await? else {
            out.put_slice(b"CLIENT_ERROR bad data chunk\r\n");
            return Ok(());
        };

        let Some(entry) = self.cache.load(&key) else {
            if !noreply {
                out.put_slice(b"NOT_STORED\r\n");
            }
            return Ok(());
        };

        let existing = entry.value();
        let mut combined = BytesMut::with_capacity(existing.len() + data.len());
        if append {
            combined.put_slice(&existing);
            combined.put_slice(&data);
        } else {
            combined.put_slice(&data);
            combined.put_slice(&existing);
        }

        let opts = StoreOptions {
            flags: entry.flags(),
            ..Default::default()
        };
        self.cache.store(key, combined.freeze(), Some(&opts));

        if !noreply {
            out.put_slice(b"STORED\r\n");
        }
        Ok(())
    }

    async fn do_cas<R>(&self, reader: &mut R, out: &mut BytesMut, parts: &[&[u8]]) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let Some((key, flags, exptime, bytes, _)) = parse_store_header(parts) else {
            out.put_slice(b"CLIENT_ERROR bad command line format\r\n");
            return Ok(());
        };
        let Some(cas) = parts.get(5).and_then(|p| parse_num::<u64>(p)) else {
            out.put_slice(b"CLIENT_ERROR bad command line format\r\n");
            return Ok(());
        };
        let noreply = parts.get(6).copied() == Some(b"noreply".as_slice());

        let Some(data) = read_data_block(reader, bytes).await? else {
            out.put_slice(b"CLIENT_ERROR bad data chunk\r\n");
            return Ok(());
        };

        if self.cache.load(&key).is_none() {
            if !noreply {
                out.put_slice(b"NOT_FOUND\r\n");
            }
            return Ok(());
        }

        let opts = StoreOptions {
            ttl: exptime_to_ttl(exptime),
            flags,
            ..Default::default()
        };

        if self.cache.compare_and_swap(&key, data, cas, Some(&opts)) {
            if !noreply {
                out.put_slice(b"STORED\r\n");
            }
        } else if !noreply {
            out.put_slice(b"EXISTS\r\n");
        }
        Ok(())
    }

    fn do_delete(&self, out: &mut BytesMut, parts: &[&[u8]]) {
        if parts.len() < 2 {
            out.put_slice(b"CLIENT_ERROR bad command line format\r\n");
            return;
        }
        let noreply = parts.len() > 2 && parts[parts.len() - 1] == b"noreply";

        let reply: &[u8] = if self.cache.delete(parts[1]) {
            b"DELETED\r\n"
        } else {
            b"NOT_FOUND\r\n"
        };
        if !noreply {
            out.put_slice(reply);
        }
    }

    fn do_incr(&self, out: &mut BytesMut, parts: &[&[u8]], incr: bool) {
        if parts.len() < 3 {
            out.put_slice(b"CLIENT_ERROR bad command line format\r\n");
            return;
        }
        let Some(mut delta) = parse_num::<i64>(parts[2]) else {
            out.put_slice(b"CLIENT_ERROR invalid numeric delta argument\r\n");
            return;
        };
        let noreply = parts.get(3).copied() == Some(b"noreply".as_slice());

        if !incr {
            delta = -delta;
        }

        let mut new_value = self.cache.increment(parts[1], delta);
        if new_value < 0 {
            // decr floors at zero on the wire; rewrite the stored value too.
            new_value = 0;
            self.cache
                .store(Bytes::copy_from_slice(parts[1]), Bytes::from("0"), None);
        }

        if !noreply {
            out.put_slice(format!("{}\r\n", new_value).as_bytes());
        }
    }

    fn do_touch(&self, out: &mut BytesMut, parts: &[&[u8]]) {
        if parts.len() < 3 {
            out.put_slice(b"CLIENT_ERROR bad command line format\r\n");
            return;
        }
        let Some(exptime) = parse_num::<i64>(parts[2]) else {
            out.put_slice(b"CLIENT_ERROR bad command line format\r\n");
            return;
        };
        let noreply = parts.get(3).copied() == Some(b"noreply".as_slice());

        let Some(entry) = self.cache.load(parts[1]) else {
            if !noreply {
                out.put_slice(b"NOT_FOUND\r\n");
            }
            return;
        };

        if exptime > 0 {
            if exptime < EXPTIME_ABSOLUTE_CUTOFF {
                entry.set_expire_at(now_nanos() + exptime * 1_000_000_000);
            } else {
                entry.set_expire_at(exptime * 1_000_000_000);
            }
        } else {
            entry.set_expire_at(0);
        }

        if !noreply {
            out.put_slice(b"TOUCHED\r\n");
        }
    }

    fn do_stats(&self, out: &mut BytesMut) {
        let stats = self.cache.stats();
        let text = format!(
            "STAT curr_items {}\r\n\
             STAT bytes {}\r\n\
             STAT limit_maxbytes {}\r\n\
             STAT cmd_get {}\r\n\
             STAT get_hits {}\r\n\
             STAT get_misses {}\r\n\
             STAT evictions {}\r\n\
             STAT expired_unfetched {}\r\n\
             END\r\n",
            stats.num_items,
            stats.mem_used,
            stats.max_memory,
            stats.num_hits + stats.num_misses,
            stats.num_hits,
            stats.num_misses,
            stats.num_evicted,
            stats.num_expired,
        );
        out.put_slice(text.as_bytes());
    }
}

/// `<cmd> <key> <flags> <exptime> <bytes> [noreply]`
fn parse_store_header(parts: &[&[u8]]) -> Option<(Bytes, u32, i64, usize, bool)> {
    if parts.len() < 5 {
        return None;
    }
    let key = Bytes::copy_from_slice(parts[1]);
    let flags = parse_num::<u32>(parts[2])?;
    let exptime = parse_num::<i64>(parts[3])?;
    let bytes = parse_num::<usize>(parts[4])?;
    let noreply = parts.get(5).copied() == Some(b"noreply".as_slice());
    Some((key, flags, exptime, bytes, noreply))
}

/// Reads `len` data bytes plus the trailing line. `None` means the chunk
/// was malformed (missing terminator).
async fn read_data_block<R>(reader: &mut R, len: usize) -> io::Result<Option<Bytes>>
where
    R: AsyncBufRead + Unpin,
{
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;

    let mut tail = Vec::with_capacity(2);
    if reader.read_until(b'\n', &mut tail).await? == 0 {
        return Ok(None);
    }
    Ok(Some(Bytes::from(data)))
}

fn exptime_to_ttl(exptime: i64) -> Option<Duration> {
    if exptime <= 0 {
        return None;
    }
    if exptime < EXPTIME_ABSOLUTE_CUTOFF {
        return Some(Duration::from_secs(exptime as u64));
    }
    // Absolute Unix timestamp; one already in the past means no expiry.
    let remaining = exptime - now_nanos() / 1_000_000_000;
    if remaining > 0 {
        Some(Duration::from_secs(remaining as u64))
    } else {
        None
    }
}

fn parse_num<T: std::str::FromStr>(part: &[u8]) -> Option<T> {
    std::str::from_utf8(part).ok()?.parse().ok()
}

fn trim_line(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}
