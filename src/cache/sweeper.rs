//! Background Sweeper
//!
//! Lazy expiry (checking on access) reclaims nothing for keys that are
//! never touched again, and lazily evicted entries stay in their maps
//! until something removes them. The sweeper is the periodic task that
//! does both: each tick walks all shards removing expired entries, then
//! removes evicted entries from any shard where they exceed the 10%
//! threshold.

use super::Cache;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Sweeper configuration.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Time between sweep passes.
    pub interval: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
        }
    }
}

/// A handle to the running sweeper task.
///
/// Dropping the handle stops the task.
#[derive(Debug)]
pub struct Sweeper {
    shutdown_tx: watch::Sender<bool>,
}

impl Sweeper {
    /// Starts the sweeper as a background task.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let cache = Arc::new(Cache::new(16, 0));
    /// let sweeper = Sweeper::start(Arc::clone(&cache), SweeperConfig::default());
    ///
    /// // ... the task runs until the handle is dropped
    /// drop(sweeper);
    /// ```
    pub fn start(cache: Arc<Cache>, config: SweeperConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(sweeper_loop(cache, config, shutdown_rx));
        info!("Background sweeper started");

        Self { shutdown_tx }
    }

    /// Stops the sweeper. Called automatically on drop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn sweeper_loop(
    cache: Arc<Cache>,
    config: SweeperConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(config.interval) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("Sweeper received shutdown signal");
                    return;
                }
            }
        }

        let expired = cache.sweep();
        let evicted = cache.sweep_evicted();

        if expired > 0 || evicted > 0 {
            debug!(expired, evicted, "Sweep pass removed entries");
        }
    }
}
