//! Server Orchestration
//!
//! Owns the TCP listener and the lifecycle around it: one task per
//! accepted connection, protocol detection up front, dispatch to the
//! enabled dialect handler, and a watch-channel shutdown signal wired to
//! SIGINT/SIGTERM. The accept loop observes the signal and returns;
//! in-flight handlers run to their own completion.

use crate::cache::{Cache, Sweeper, SweeperConfig};
use crate::protocol::{
    detect, Dialect, HttpHandler, MemcacheHandler, PostgresHandler, RespHandler,
};
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Host to bind to.
    pub host: String,
    /// Port to listen on. 0 means "no listener", which is a startup error.
    pub port: u16,
    /// Password for RESP `AUTH`, HTTP bearer tokens and Postgres
    /// cleartext authentication. `None` disables authentication.
    pub auth: Option<String>,
    /// Dialect enable flags.
    pub resp: bool,
    pub http: bool,
    pub memcache: bool,
    pub postgres: bool,
    /// Whether to run the background sweeper.
    pub auto_sweep: bool,
    pub sweep_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            auth: None,
            resp: true,
            http: false,
            memcache: false,
            postgres: false,
            auto_sweep: true,
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// The per-dialect handlers, built once and cloned into each connection
/// task. A disabled dialect stays `None` and its connections are dropped.
#[derive(Clone)]
struct Handlers {
    resp: Option<RespHandler>,
    http: Option<HttpHandler>,
    memcache: Option<MemcacheHandler>,
    postgres: Option<PostgresHandler>,
}

pub struct Server {
    config: Config,
    cache: Arc<Cache>,
    handlers: Handlers,
}

impl Server {
    pub fn new(cache: Arc<Cache>, config: Config) -> Self {
        let handlers = Handlers {
            resp: config
                .resp
                .then(|| RespHandler::new(Arc::clone(&cache), config.auth.clone())),
            http: config
                .http
                .then(|| HttpHandler::new(Arc::clone(&cache), config.auth.clone())),
            memcache: config
                .memcache
                .then(|| MemcacheHandler::new(Arc::clone(&cache))),
            postgres: config
                .postgres
                .then(|| PostgresHandler::new(Arc::clone(&cache), config.auth.clone())),
        };

        Self {
            config,
            cache,
            handlers,
        }
    }

    /// Binds the listener, installs signal handling, and serves until
    /// SIGINT or SIGTERM arrives.
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = self.bind().await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Shutdown signal received, stopping server...");
            let _ = shutdown_tx.send(true);
        });

        self.serve(listener, shutdown_rx).await
    }

    /// Binds the configured TCP listener. Fails when no listener is
    /// configured or the address is unusable.
    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        if self.config.port == 0 {
            anyhow::bail!("no listeners configured");
        }

        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to listen on {}", addr))?;

        info!("Listening on {}", addr);
        Ok(listener)
    }

    /// The accept loop. Returns cleanly when the shutdown channel flips.
    pub async fn serve(
        self,
        listener: TcpListener,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let _sweeper = self.config.auto_sweep.then(|| {
            Sweeper::start(
                Arc::clone(&self.cache),
                SweeperConfig {
                    interval: self.config.sweep_interval,
                },
            )
        });

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            debug!(client = %addr, "Client connected");
                            let handlers = self.handlers.clone();
                            tokio::spawn(handle_connection(handlers, stream));
                        }
                        Err(e) => warn!(error = %e, "Failed to accept connection"),
                    }
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("Server shutdown complete");
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Detects the dialect and runs the matching handler to completion.
async fn handle_connection(handlers: Handlers, stream: TcpStream) {
    let (dialect, stream) = match detect(stream).await {
        Ok(detected) => detected,
        Err(e) => {
            debug!(error = %e, "Protocol detection failed");
            return;
        }
    };

    match dialect {
        Dialect::Resp => match &handlers.resp {
            Some(handler) => handler.handle(stream).await,
            None => debug!("RESP dialect disabled, dropping connection"),
        },
        Dialect::Http => match &handlers.http {
            Some(handler) => handler.handle(stream).await,
            None => debug!("HTTP dialect disabled, dropping connection"),
        },
        Dialect::Memcache => match &handlers.memcache {
            Some(handler) => handler.handle(stream).await,
            None => debug!("Memcache dialect disabled, dropping connection"),
        },
        Dialect::Postgres => match &handlers.postgres {
            Some(handler) => handler.handle(stream).await,
            None => debug!("Postgres dialect disabled, dropping connection"),
        },
    }
}

/// Resolves when SIGINT (Ctrl+C) or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
