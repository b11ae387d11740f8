//! Lossy bus wrapper for testing unreliable message delivery.
//!
//! Wraps any `Bus` implementation and optionally drops or duplicates
//! published messages based on configurable probabilities. Useful for
//! testing reply timeouts and at-most-once continuation delivery.
//!
//! # Example
//!
//! ```ignore
//! use switchboard::bus::{ChannelBus, LossyBus, LossyConfig};
//!
//! // Create a bus that drops 10% of messages
//! let lossy = LossyBus::new(ChannelBus::default(), LossyConfig::with_drop_rate(0.1));
//!
//! // Or one that delivers every message twice
//! let doubled = LossyBus::new(ChannelBus::default(), LossyConfig::duplicate_all());
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{Bus, BusError, MessageHandler, Result};

/// Configuration for lossy behavior.
#[derive(Clone, Debug)]
pub struct LossyConfig {
    /// Probability of dropping a message (0.0 to 1.0).
    /// - 0.0 = never drop (pass-through)
    /// - 0.5 = drop 50% of messages
    /// - 1.0 = drop all messages
    pub drop_rate: f64,
    /// Probability of publishing a surviving message a second time (0.0 to 1.0).
    pub duplicate_rate: f64,
    /// Whether to log dropped and duplicated messages.
    pub log_drops: bool,
}

impl Default for LossyConfig {
    fn default() -> Self {
        Self::none()
    }
}

impl LossyConfig {
    /// Create a config that never drops messages (pass-through).
    pub fn none() -> Self {
        Self {
            drop_rate: 0.0,
            duplicate_rate: 0.0,
            log_drops: false,
        }
    }

    /// Create a config with a specific drop rate.
    ///
    /// # Arguments
    /// * `rate` - Drop probability (0.0 to 1.0), clamped to valid range
    pub fn with_drop_rate(rate: f64) -> Self {
        Self {
            drop_rate: rate.clamp(0.0, 1.0),
            duplicate_rate: 0.0,
            log_drops: true,
        }
    }

    /// Create a config that drops all messages.
    pub fn drop_all() -> Self {
        Self::with_drop_rate(1.0)
    }

    /// Create a config that publishes every message twice.
    pub fn duplicate_all() -> Self {
        Self {
            drop_rate: 0.0,
            duplicate_rate: 1.0,
            log_drops: true,
        }
    }

    /// Set the duplication probability, clamped to valid range.
    pub fn with_duplicate_rate(mut self, rate: f64) -> Self {
        self.duplicate_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Set whether to log dropped messages.
    pub fn with_logging(mut self, log: bool) -> Self {
        self.log_drops = log;
        self
    }

    /// Check if this config has any lossy behavior enabled.
    pub fn is_lossy(&self) -> bool {
        self.drop_rate > 0.0 || self.duplicate_rate > 0.0
    }
}

/// Statistics for the lossy bus.
#[derive(Debug, Default)]
pub struct LossyStats {
    /// Total messages received for publish.
    pub total: AtomicU64,
    /// Messages that were dropped.
    pub dropped: AtomicU64,
    /// Messages that were passed through.
    pub passed: AtomicU64,
    /// Extra copies published.
    pub duplicated: AtomicU64,
}

impl LossyStats {
    /// Get a snapshot of current stats as `(total, dropped, passed)`.
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.total.load(Ordering::Relaxed),
            self.dropped.load(Ordering::Relaxed),
            self.passed.load(Ordering::Relaxed),
        )
    }

    /// Number of extra copies published.
    pub fn duplicated(&self) -> u64 {
        self.duplicated.load(Ordering::Relaxed)
    }

    /// Get the actual drop rate observed.
    pub fn observed_drop_rate(&self) -> f64 {
        let total = self.total.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            self.dropped.load(Ordering::Relaxed) as f64 / total as f64
        }
    }

    /// Reset all counters.
    pub fn reset(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
        self.passed.store(0, Ordering::Relaxed);
        self.duplicated.store(0, Ordering::Relaxed);
    }
}

/// Wrapper that optionally drops or duplicates messages for testing.
///
/// When both rates are 0.0, this is a pure pass-through with minimal overhead.
pub struct LossyBus<B: Bus> {
    inner: B,
    config: LossyConfig,
    stats: Arc<LossyStats>,
}

impl<B: Bus> LossyBus<B> {
    /// Create a new lossy wrapper around an existing bus.
    pub fn new(inner: B, config: LossyConfig) -> Self {
        Self::with_stats(inner, config, Arc::new(LossyStats::default()))
    }

    fn with_stats(inner: B, config: LossyConfig, stats: Arc<LossyStats>) -> Self {
        if config.is_lossy() {
            warn!(
                drop_rate = config.drop_rate,
                duplicate_rate = config.duplicate_rate,
                "Lossy bus enabled - messages may be dropped or duplicated"
            );
        }

        Self {
            inner,
            config,
            stats,
        }
    }

    /// Create a pass-through wrapper (no message loss).
    pub fn passthrough(inner: B) -> Self {
        Self::new(inner, LossyConfig::none())
    }

    /// Get the underlying bus.
    pub fn inner(&self) -> &B {
        &self.inner
    }

    /// Consume wrapper and return the inner bus.
    pub fn into_inner(self) -> B {
        self.inner
    }

    /// Get current statistics.
    pub fn stats(&self) -> &LossyStats {
        &self.stats
    }

    /// Update the drop rate at runtime.
    pub fn set_drop_rate(&mut self, rate: f64) {
        self.config.drop_rate = rate.clamp(0.0, 1.0);
    }

    fn roll(rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        if rate >= 1.0 {
            return true;
        }
        rand::rng().random::<f64>() < rate
    }
}

#[async_trait]
impl<B: Bus> Bus for LossyBus<B> {
    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        self.stats.total.fetch_add(1, Ordering::Relaxed);

        if Self::roll(self.config.drop_rate) {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);

            if self.config.log_drops {
                debug!(channel = %channel, "Lossy bus dropped message");
            }

            // Return success but don't actually publish
            return Ok(());
        }

        self.stats.passed.fetch_add(1, Ordering::Relaxed);

        if Self::roll(self.config.duplicate_rate) {
            self.stats.duplicated.fetch_add(1, Ordering::Relaxed);
            if self.config.log_drops {
                debug!(channel = %channel, "Lossy bus duplicated message");
            }
            self.inner.publish(channel, payload.clone()).await?;
        }

        self.inner.publish(channel, payload).await
    }

    async fn subscribe(&self, channel: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        // Subscribe passes through - we only interfere on publish
        self.inner.subscribe(channel, handler).await
    }

    async fn unsubscribe(&self, channel: &str, handler: &Arc<dyn MessageHandler>) -> Result<()> {
        self.inner.unsubscribe(channel, handler).await
    }

    fn transport_errors(&self) -> broadcast::Receiver<BusError> {
        self.inner.transport_errors()
    }

    async fn fork(&self) -> Result<Arc<dyn Bus>> {
        let inner = self.inner.fork().await?;
        Ok(Arc::new(LossyBus::with_stats(
            inner,
            self.config.clone(),
            self.stats.clone(),
        )))
    }
}
