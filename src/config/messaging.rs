//! Messaging (bus) configuration types.

use serde::Deserialize;

use crate::bus::channel::DEFAULT_CHANNEL_CAPACITY;

/// Messaging type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagingType {
    /// In-process broadcast channel (no external broker).
    #[default]
    Channel,
    /// Redis PUBLISH/SUBSCRIBE.
    Redis,
    /// NATS core subjects.
    Nats,
}

/// Messaging configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Messaging type discriminator.
    #[serde(rename = "type")]
    pub messaging_type: MessagingType,
    /// Channel-bus-specific configuration.
    pub channel: ChannelSettings,
    /// Redis-specific configuration.
    pub redis: RedisSettings,
    /// NATS-specific configuration.
    pub nats: NatsSettings,
}

/// In-process channel bus settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    /// Messages buffered per consumer before it lags.
    pub capacity: usize,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Redis connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    /// Redis connection URL.
    pub url: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
        }
    }
}

/// NATS connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NatsSettings {
    /// NATS server URL.
    pub url: String,
}

impl Default for NatsSettings {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
        }
    }
}
