//! ferrocache server entry point.
//!
//! Parses flags, builds the runtime and the cache, and runs the server
//! until SIGINT/SIGTERM.

use anyhow::Context;
use clap::Parser;
use ferrocache::cache::Cache;
use ferrocache::server::{Config, Server};
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "ferrocache", version, about = "Multi-protocol in-memory caching server")]
struct Args {
    /// Listening hostname
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Listening port
    #[arg(short, long, default_value_t = 6379)]
    port: u16,

    /// Authentication password (RESP AUTH, HTTP bearer token, Postgres
    /// cleartext password)
    #[arg(long)]
    auth: Option<String>,

    /// Worker threads (0 = one per CPU core)
    #[arg(long, default_value_t = 0)]
    threads: usize,

    /// Number of cache shards
    #[arg(long, default_value_t = 16)]
    shards: usize,

    /// Maximum memory, with optional unit suffix (e.g. 512MB, 1GB).
    /// 0 disables eviction.
    #[arg(long, default_value = "0")]
    maxmemory: String,

    /// Enable the RESP (Redis) dialect
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    resp: bool,

    /// Enable the HTTP dialect
    #[arg(long)]
    http: bool,

    /// Enable the memcache text dialect
    #[arg(long)]
    memcache: bool,

    /// Enable the Postgres-wire dialect
    #[arg(long)]
    postgres: bool,

    /// Disable the background expired/evicted sweeper
    #[arg(long)]
    no_sweep: bool,

    /// Sweep interval in seconds
    #[arg(long, default_value_t = 1)]
    sweep_interval: u64,

    /// Only log errors
    #[arg(long)]
    quiet: bool,

    /// Log debug detail
    #[arg(long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        Level::DEBUG
    } else if args.quiet {
        Level::ERROR
    } else {
        Level::INFO
    };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .init();

    let max_memory = parse_memory_size(&args.maxmemory)?;

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if args.threads > 0 {
        builder.worker_threads(args.threads);
    }
    let runtime = builder
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    runtime.block_on(async move {
        let cache = Arc::new(Cache::new(args.shards, max_memory));

        if !args.quiet {
            print_banner(&args, max_memory);
        }

        let config = Config {
            host: args.host,
            port: args.port,
            auth: args.auth,
            resp: args.resp,
            http: args.http,
            memcache: args.memcache,
            postgres: args.postgres,
            auto_sweep: !args.no_sweep,
            sweep_interval: Duration::from_secs(args.sweep_interval.max(1)),
        };

        Server::new(cache, config).run().await
    })
}

fn print_banner(args: &Args, max_memory: i64) {
    println!("ferrocache v{}", ferrocache::VERSION);
    println!("Host: {}:{}", args.host, args.port);
    println!("Shards: {}", args.shards);

    if max_memory > 0 {
        println!("Max memory: {}", format_bytes(max_memory));
    } else {
        println!("Max memory: unlimited");
    }

    let mut dialects = Vec::new();
    if args.resp {
        dialects.push("RESP");
    }
    if args.http {
        dialects.push("HTTP");
    }
    if args.memcache {
        dialects.push("Memcache");
    }
    if args.postgres {
        dialects.push("Postgres");
    }
    println!("Dialects: {}", dialects.join(", "));
    println!();
}

/// Parses a memory size with an optional K/M/G/T suffix (optionally
/// followed by `B`), case-insensitive: `1024`, `64k`, `512MB`, `2G`.
fn parse_memory_size(input: &str) -> anyhow::Result<i64> {
    let input = input.trim();
    if input.is_empty() || input == "0" {
        return Ok(0);
    }

    let digits_end = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (digits, unit) = input.split_at(digits_end);
    let size: i64 = digits
        .parse()
        .with_context(|| format!("invalid memory size '{}'", input))?;

    let multiplier: i64 = match unit.to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => 1024 * 1024,
        "G" | "GB" => 1024 * 1024 * 1024,
        "T" | "TB" => 1024i64 * 1024 * 1024 * 1024,
        _ => anyhow::bail!("unknown memory unit '{}'", unit),
    };

    Ok(size * multiplier)
}

fn format_bytes(bytes: i64) -> String {
    const UNIT: i64 = 1024;
    if bytes < UNIT {
        return format!("{} B", bytes);
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    format!("{:.1} {}B", bytes as f64 / div as f64, b"KMGTPE"[exp] as char)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_size() {
        assert_eq!(parse_memory_size("0").unwrap(), 0);
        assert_eq!(parse_memory_size("").unwrap(), 0);
        assert_eq!(parse_memory_size("1024").unwrap(), 1024);
        assert_eq!(parse_memory_size("64k").unwrap(), 64 * 1024);
        assert_eq!(parse_memory_size("64K").unwrap(), 64 * 1024);
        assert_eq!(parse_memory_size("512MB").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory_size("2g").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory_size("1TB").unwrap(), 1024i64.pow(4));
        assert!(parse_memory_size("12X").is_err());
        assert!(parse_memory_size("abc").is_err());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(100), "100 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.0 MB");
    }
}
