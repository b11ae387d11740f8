//! In-memory channel-based bus for single-process deployments.
//!
//! Uses a tokio broadcast channel for pub/sub within a single process.
//! Ideal for local development and testing without external dependencies.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info};

use super::dispatch::{dispatch_to_handlers, SubscriptionTable};
use super::{Bus, BusError, BusMessage, MessageHandler, Result, ERROR_FEED_CAPACITY};

/// Default channel capacity for broadcast.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Configuration for the channel bus.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Messages buffered per consumer before it starts lagging.
    pub capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// In-memory bus using a tokio broadcast channel.
///
/// Every message is broadcast to every bus handle sharing the sender.
/// Channel filtering is done on the subscriber side by the subscription table.
pub struct ChannelBus {
    /// Broadcast sender for publishing messages.
    sender: broadcast::Sender<Arc<BusMessage>>,
    /// Handlers registered on this handle, by channel.
    subscriptions: SubscriptionTable,
    /// Flag indicating if the consumer task is running.
    consuming: Arc<RwLock<bool>>,
    /// Transport error feed.
    errors: broadcast::Sender<BusError>,
}

impl ChannelBus {
    /// Create a new channel bus.
    pub fn new(config: ChannelConfig) -> Self {
        let (sender, _) = broadcast::channel(config.capacity.max(1));

        info!(capacity = config.capacity, "Channel bus initialized");

        Self::with_sender(sender)
    }

    fn with_sender(sender: broadcast::Sender<Arc<BusMessage>>) -> Self {
        let (errors, _) = broadcast::channel(ERROR_FEED_CAPACITY);
        Self {
            sender,
            subscriptions: SubscriptionTable::new(),
            consuming: Arc::new(RwLock::new(false)),
            errors,
        }
    }

    /// Create a new bus handle sharing the same channel but with its own subscriptions.
    pub fn linked(&self) -> Self {
        Self::with_sender(self.sender.clone())
    }

    /// Whether any handler on this handle is subscribed to `channel`.
    pub async fn is_subscribed(&self, channel: &str) -> bool {
        self.subscriptions.is_subscribed(channel).await
    }

    /// Number of distinct channels subscribed on this handle.
    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.channel_count().await
    }

    /// Start the consumer task if it is not running yet.
    ///
    /// The broadcast receiver is created before returning, so messages
    /// published afterwards are never missed.
    async fn ensure_consuming(&self) {
        {
            let mut consuming = self.consuming.write().await;
            if *consuming {
                return;
            }
            *consuming = true;
        }

        let mut receiver = self.sender.subscribe();
        let subscriptions = self.subscriptions.clone();
        let errors = self.errors.clone();

        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => {
                        dispatch_to_handlers(&subscriptions, message).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        error!(skipped = n, "Channel consumer lagged, skipped messages");
                        let _ = errors.send(BusError::Lagged(n));
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Channel closed, stopping consumer");
                        let _ = errors.send(BusError::Closed);
                        break;
                    }
                }
            }
        });

        debug!("Channel consumer started");
    }
}

impl Default for ChannelBus {
    fn default() -> Self {
        Self::new(ChannelConfig::default())
    }
}

#[async_trait]
impl Bus for ChannelBus {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(channel = %channel))]
    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        // Send to channel (ignore error if no receivers)
        match self.sender.send(Arc::new(BusMessage::new(channel, payload))) {
            Ok(receiver_count) => {
                debug!(receivers = receiver_count, "Published message to channel");
            }
            Err(_) => {
                debug!("Published message (no receivers)");
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        self.subscriptions.add(channel, handler).await;
        self.ensure_consuming().await;

        debug!(channel = %channel, "Handler subscribed to channel bus");

        Ok(())
    }

    async fn unsubscribe(&self, channel: &str, handler: &Arc<dyn MessageHandler>) -> Result<()> {
        if self.subscriptions.remove(channel, handler).await {
            debug!(channel = %channel, "Last handler left channel");
        }
        Ok(())
    }

    fn transport_errors(&self) -> broadcast::Receiver<BusError> {
        self.errors.subscribe()
    }

    async fn fork(&self) -> Result<Arc<dyn Bus>> {
        Ok(Arc::new(self.linked()))
    }
}
