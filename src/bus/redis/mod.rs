//! Redis PUBLISH/SUBSCRIBE bus.
//!
//! Publishing goes through a shared `ConnectionManager`, which reconnects on
//! its own. Every subscribed channel gets a dedicated pub/sub connection and
//! reader task; a reader whose stream ends reports a connection error on the
//! transport error feed.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::dispatch::{dispatch_to_handlers, SubscriptionTable};
use super::{Bus, BusError, BusMessage, MessageHandler, Result, ERROR_FEED_CAPACITY};

impl From<redis::RedisError> for BusError {
    fn from(e: redis::RedisError) -> Self {
        BusError::Connection(e.to_string())
    }
}

pub struct RedisBus {
    url: String,
    client: Client,
    conn: ConnectionManager,
    subscriptions: SubscriptionTable,
    /// Reader task per subscribed channel.
    readers: Mutex<HashMap<String, JoinHandle<()>>>,
    errors: broadcast::Sender<BusError>,
}

impl RedisBus {
    /// Connect to Redis.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., redis://localhost:6379)
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        let (errors, _) = broadcast::channel(ERROR_FEED_CAPACITY);

        info!(url = %url, "Connected to Redis for pub/sub");

        Ok(Self {
            url: url.to_string(),
            client,
            conn,
            subscriptions: SubscriptionTable::new(),
            readers: Mutex::new(HashMap::new()),
            errors,
        })
    }

    /// Open a pub/sub connection for `channel` and start its reader.
    ///
    /// Returns after Redis acknowledged the SUBSCRIBE.
    async fn start_reader(&self, channel: &str) -> Result<()> {
        let subscribe_error = |e: redis::RedisError| BusError::Subscribe {
            channel: channel.to_string(),
            message: e.to_string(),
        };

        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(subscribe_error)?;
        pubsub.subscribe(channel).await.map_err(subscribe_error)?;

        let subscriptions = self.subscriptions.clone();
        let errors = self.errors.clone();
        let channel_name = channel.to_string();

        let reader = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(channel = %channel_name, error = %e, "Dropped non-UTF-8 message");
                        continue;
                    }
                };
                let message = Arc::new(BusMessage::new(msg.get_channel_name(), payload));
                dispatch_to_handlers(&subscriptions, message).await;
            }

            error!(channel = %channel_name, "Redis subscription stream ended");
            let _ = errors.send(BusError::Connection(format!(
                "subscription to '{}' closed",
                channel_name
            )));
        });

        if let Some(stale) = self.readers.lock().await.insert(channel.to_string(), reader) {
            stale.abort();
        }
        Ok(())
    }
}

#[async_trait]
impl Bus for RedisBus {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(channel = %channel))]
    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        let mut conn = self.conn.clone();
        let receivers: i64 = conn
            .publish(channel, payload)
            .await
            .map_err(|e| BusError::Publish {
                channel: channel.to_string(),
                message: e.to_string(),
            })?;

        debug!(receivers = receivers, "Published message to Redis");
        Ok(())
    }

    async fn subscribe(&self, channel: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        if self.subscriptions.add(channel, handler.clone()).await {
            if let Err(e) = self.start_reader(channel).await {
                // Leave no handler behind without a reader
                self.subscriptions.remove(channel, &handler).await;
                return Err(e);
            }
        }

        debug!(channel = %channel, "Handler subscribed to Redis bus");
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str, handler: &Arc<dyn MessageHandler>) -> Result<()> {
        // Hold the reader map so a concurrent first subscribe cannot slip in
        // between the table update and the abort
        let mut readers = self.readers.lock().await;
        if self.subscriptions.remove(channel, handler).await {
            if let Some(reader) = readers.remove(channel) {
                reader.abort();
            }
            debug!(channel = %channel, "Stopped Redis subscription");
        }
        Ok(())
    }

    fn transport_errors(&self) -> broadcast::Receiver<BusError> {
        self.errors.subscribe()
    }

    async fn fork(&self) -> Result<Arc<dyn Bus>> {
        Ok(Arc::new(RedisBus::connect(&self.url).await?))
    }
}

impl Drop for RedisBus {
    fn drop(&mut self) {
        for (_, reader) in self.readers.get_mut().drain() {
            reader.abort();
        }
    }
}
