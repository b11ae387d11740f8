//! Mock bus implementation for testing.
//!
//! Records every publish instead of delivering it. Subscribed handlers only
//! see messages injected explicitly with [`MockBus::deliver`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};

use super::dispatch::{dispatch_to_handlers, SubscriptionTable};
use super::{Bus, BusError, BusMessage, MessageHandler, Result, ERROR_FEED_CAPACITY};

/// Mock bus for testing.
#[derive(Clone)]
pub struct MockBus {
    published: Arc<RwLock<Vec<BusMessage>>>,
    fail_on_publish: Arc<RwLock<bool>>,
    refused_channels: Arc<RwLock<Vec<String>>>,
    subscriptions: SubscriptionTable,
    errors: broadcast::Sender<BusError>,
}

impl MockBus {
    pub fn new() -> Self {
        let (errors, _) = broadcast::channel(ERROR_FEED_CAPACITY);
        Self {
            published: Arc::new(RwLock::new(Vec::new())),
            fail_on_publish: Arc::new(RwLock::new(false)),
            refused_channels: Arc::new(RwLock::new(Vec::new())),
            subscriptions: SubscriptionTable::new(),
            errors,
        }
    }

    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.fail_on_publish.write().await = fail;
    }

    /// Make every later `subscribe` to `channel` fail.
    pub async fn refuse_subscriptions_to(&self, channel: impl Into<String>) {
        self.refused_channels.write().await.push(channel.into());
    }

    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }

    pub async fn published(&self) -> Vec<BusMessage> {
        self.published.read().await.clone()
    }

    pub async fn take_published(&self) -> Vec<BusMessage> {
        std::mem::take(&mut *self.published.write().await)
    }

    pub async fn is_subscribed(&self, channel: &str) -> bool {
        self.subscriptions.is_subscribed(channel).await
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.channel_count().await
    }

    /// Hand a message straight to the handlers subscribed to `channel`.
    ///
    /// Returns `false` if any handler failed.
    pub async fn deliver(&self, channel: &str, payload: impl Into<String>) -> bool {
        let message = Arc::new(BusMessage::new(channel, payload));
        dispatch_to_handlers(&self.subscriptions, message).await
    }

    /// Push an error onto the transport error feed.
    pub fn emit_error(&self, error: BusError) {
        let _ = self.errors.send(error);
    }
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for MockBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        if *self.fail_on_publish.read().await {
            return Err(BusError::Publish {
                channel: channel.to_string(),
                message: "Mock publish failure".to_string(),
            });
        }
        self.published
            .write()
            .await
            .push(BusMessage::new(channel, payload));
        Ok(())
    }

    async fn subscribe(&self, channel: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        if self.refused_channels.read().await.iter().any(|c| c == channel) {
            return Err(BusError::Subscribe {
                channel: channel.to_string(),
                message: "Mock subscribe failure".to_string(),
            });
        }
        self.subscriptions.add(channel, handler).await;
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str, handler: &Arc<dyn MessageHandler>) -> Result<()> {
        self.subscriptions.remove(channel, handler).await;
        Ok(())
    }

    fn transport_errors(&self) -> broadcast::Receiver<BusError> {
        self.errors.subscribe()
    }

    async fn fork(&self) -> Result<Arc<dyn Bus>> {
        Ok(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{recv_within, RecordingHandler};
    use std::time::Duration;

    #[tokio::test]
    async fn test_mock_bus_publish() {
        let bus = MockBus::new();

        bus.publish("/echo", "{}".to_string()).await.unwrap();

        assert_eq!(bus.published_count().await, 1);
        assert_eq!(bus.published().await[0].channel, "/echo");
    }

    #[tokio::test]
    async fn test_mock_bus_fail_on_publish() {
        let bus = MockBus::new();
        bus.set_fail_on_publish(true).await;

        let result = bus.publish("/echo", "{}".to_string()).await;

        assert!(matches!(result, Err(BusError::Publish { .. })));
        assert_eq!(bus.published_count().await, 0);
    }

    #[tokio::test]
    async fn test_mock_bus_deliver_reaches_subscriber() {
        let bus = MockBus::new();
        let (handler, mut rx) = RecordingHandler::new();
        bus.subscribe("/echo", handler).await.unwrap();

        assert!(bus.deliver("/echo", "{}").await);

        let message = recv_within(&mut rx, Duration::from_secs(1)).await.unwrap();
        assert_eq!(message.payload, "{}");
    }

    #[tokio::test]
    async fn test_mock_bus_unsubscribe_stops_delivery() {
        let bus = MockBus::new();
        let (handler, mut rx) = RecordingHandler::new();
        let handler: Arc<dyn MessageHandler> = handler;
        bus.subscribe("/echo", handler.clone()).await.unwrap();

        bus.unsubscribe("/echo", &handler).await.unwrap();
        bus.deliver("/echo", "{}").await;

        assert!(!bus.is_subscribed("/echo").await);
        assert!(recv_within(&mut rx, Duration::from_millis(50)).await.is_none());
    }

    #[tokio::test]
    async fn test_mock_bus_refused_subscription() {
        let bus = MockBus::new();
        bus.refuse_subscriptions_to("/bad").await;
        let (handler, _rx) = RecordingHandler::new();

        let result = bus.subscribe("/bad", handler).await;

        assert!(matches!(result, Err(BusError::Subscribe { .. })));
        assert!(!bus.is_subscribed("/bad").await);
    }

    #[tokio::test]
    async fn test_mock_bus_emit_error() {
        let bus = MockBus::new();
        let mut errors = bus.transport_errors();

        bus.emit_error(BusError::Connection("gone".to_string()));

        assert_eq!(
            errors.recv().await.unwrap(),
            BusError::Connection("gone".to_string())
        );
    }
}
