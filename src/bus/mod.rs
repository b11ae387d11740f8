//! Publish/subscribe bus.
//!
//! This module contains:
//! - `Bus` trait: publish to a channel, subscribe a handler to a channel
//! - `MessageHandler` trait: for processing raw channel messages
//! - Bus configuration factory
//! - Implementations: in-memory channel, Redis, NATS, Mock, Lossy wrapper
//!
//! Channels are a flat namespace of UTF-8 strings. Payloads are UTF-8 JSON
//! text; the bus itself never inspects them.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::broadcast;
use tracing::info;

#[cfg(any(feature = "redis", feature = "nats"))]
use {
    crate::utils::retry::{connection_backoff, is_retryable_bus_error},
    backon::Retryable,
    std::time::Duration,
    tracing::warn,
};

use crate::config::{MessagingConfig, MessagingType};

// Implementation modules
pub mod channel;
pub(crate) mod dispatch;
pub mod lossy;
pub mod mock;
#[cfg(feature = "nats")]
pub mod nats;
#[cfg(feature = "redis")]
pub mod redis;

// Re-exports
pub use channel::{ChannelBus, ChannelConfig};
pub use lossy::{LossyBus, LossyConfig, LossyStats};
pub use mock::MockBus;
#[cfg(feature = "nats")]
pub use nats::NatsBus;
#[cfg(feature = "redis")]
pub use redis::RedisBus;

/// Capacity of the transport error feed handed to lifecycle watchers.
pub(crate) const ERROR_FEED_CAPACITY: usize = 64;

// ============================================================================
// Traits
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish to '{channel}' failed: {message}")]
    Publish { channel: String, message: String },

    #[error("Subscribe to '{channel}' failed: {message}")]
    Subscribe { channel: String, message: String },

    #[error("Malformed message on '{channel}': {message}")]
    Decode { channel: String, message: String },

    #[error("Consumer lagged, skipped {0} messages")]
    Lagged(u64),

    #[error("Bus closed")]
    Closed,
}

/// A message as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Channel the message was published to.
    pub channel: String,
    /// Raw UTF-8 payload (JSON by convention).
    pub payload: String,
}

impl BusMessage {
    pub fn new(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

/// Handler for processing messages from a subscribed channel.
///
/// An `Err` is logged by the dispatcher and the message dropped; it never
/// stops the subscription.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: Arc<BusMessage>)
        -> BoxFuture<'static, std::result::Result<(), BusError>>;
}

/// Capability every transport provides to the messaging core.
///
/// Implementations:
/// - `ChannelBus`: in-process tokio broadcast channel
/// - `RedisBus`: Redis PUBLISH/SUBSCRIBE (feature `redis`)
/// - `NatsBus`: NATS core subjects (feature `nats`)
/// - `MockBus`: records publishes, for testing
/// - `LossyBus`: wrapper that drops or duplicates publishes, for testing
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish a payload to a channel.
    ///
    /// Fire-and-forget: succeeds whether or not anyone is subscribed.
    async fn publish(&self, channel: &str, payload: String) -> Result<()>;

    /// Subscribe a handler to a channel.
    ///
    /// Once this returns, every later publish to `channel` reaches `handler`.
    /// Several handlers may share a channel; each receives every message.
    async fn subscribe(&self, channel: &str, handler: Arc<dyn MessageHandler>) -> Result<()>;

    /// Remove a handler previously passed to `subscribe`.
    ///
    /// Handlers are matched by identity. Once the last handler leaves a
    /// channel the transport stops listening on it. Unknown handlers are
    /// ignored.
    async fn unsubscribe(&self, channel: &str, handler: &Arc<dyn MessageHandler>) -> Result<()>;

    /// Feed of transport-level errors (connection loss, lag).
    fn transport_errors(&self) -> broadcast::Receiver<BusError>;

    /// Open an independent handle onto the same transport.
    ///
    /// Used by worker threads, which run their own runtime and must not
    /// share subscriptions with the spawning thread.
    async fn fork(&self) -> Result<Arc<dyn Bus>>;
}

#[async_trait]
impl<T: Bus + ?Sized> Bus for Arc<T> {
    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        (**self).publish(channel, payload).await
    }

    async fn subscribe(&self, channel: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        (**self).subscribe(channel, handler).await
    }

    async fn unsubscribe(&self, channel: &str, handler: &Arc<dyn MessageHandler>) -> Result<()> {
        (**self).unsubscribe(channel, handler).await
    }

    fn transport_errors(&self) -> broadcast::Receiver<BusError> {
        (**self).transport_errors()
    }

    async fn fork(&self) -> Result<Arc<dyn Bus>> {
        (**self).fork().await
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize a bus based on configuration.
///
/// Returns the appropriate `Bus` implementation based on `messaging_type`.
/// Broker-backed buses retry the initial connection with exponential backoff.
/// Requires the corresponding feature to be enabled:
/// - Redis: `--features redis`
/// - NATS: `--features nats`
pub async fn init_bus(config: &MessagingConfig) -> Result<Arc<dyn Bus>> {
    match config.messaging_type {
        MessagingType::Channel => {
            let bus = ChannelBus::new(ChannelConfig {
                capacity: config.channel.capacity,
            });
            info!(messaging_type = "channel", "Bus initialized");
            Ok(Arc::new(bus))
        }
        MessagingType::Redis => {
            #[cfg(feature = "redis")]
            {
                let url = config.redis.url.clone();
                let bus = (|| {
                    let url = url.clone();
                    async move { RedisBus::connect(&url).await }
                })
                .retry(connection_backoff())
                .when(is_retryable_bus_error)
                .notify(|err: &BusError, dur: Duration| {
                    warn!(error = %err, delay = ?dur, "Redis connection failed, retrying");
                })
                .await?;
                info!(messaging_type = "redis", "Bus initialized");
                Ok(Arc::new(bus))
            }

            #[cfg(not(feature = "redis"))]
            {
                Err(BusError::Connection(
                    "Redis support requires the 'redis' feature. Rebuild with --features redis"
                        .to_string(),
                ))
            }
        }
        MessagingType::Nats => {
            #[cfg(feature = "nats")]
            {
                let url = config.nats.url.clone();
                let bus = (|| {
                    let url = url.clone();
                    async move { NatsBus::connect(&url).await }
                })
                .retry(connection_backoff())
                .when(is_retryable_bus_error)
                .notify(|err: &BusError, dur: Duration| {
                    warn!(error = %err, delay = ?dur, "NATS connection failed, retrying");
                })
                .await?;
                info!(messaging_type = "nats", "Bus initialized");
                Ok(Arc::new(bus))
            }

            #[cfg(not(feature = "nats"))]
            {
                Err(BusError::Connection(
                    "NATS support requires the 'nats' feature. Rebuild with --features nats"
                        .to_string(),
                ))
            }
        }
    }
}
