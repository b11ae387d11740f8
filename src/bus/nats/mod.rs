//! NATS core pub/sub bus.
//!
//! Channels map one-to-one onto NATS subjects. Core NATS gives the same
//! best-effort, fire-and-forget semantics as Redis pub/sub; JetStream is not
//! used. Connection events reported by the client are forwarded to the
//! transport error feed.

use std::collections::HashMap;
use std::sync::Arc;

use async_nats::{Client, ConnectOptions, Event};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::dispatch::{dispatch_to_handlers, SubscriptionTable};
use super::{Bus, BusError, BusMessage, MessageHandler, Result, ERROR_FEED_CAPACITY};

pub struct NatsBus {
    url: String,
    client: Client,
    subscriptions: SubscriptionTable,
    /// Reader task per subscribed channel.
    readers: Mutex<HashMap<String, JoinHandle<()>>>,
    errors: broadcast::Sender<BusError>,
}

impl NatsBus {
    /// Connect to a NATS server.
    pub async fn connect(url: &str) -> Result<Self> {
        let (errors, _) = broadcast::channel(ERROR_FEED_CAPACITY);
        let feed = errors.clone();

        let client = ConnectOptions::new()
            .event_callback(move |event| {
                let feed = feed.clone();
                async move {
                    match event {
                        Event::Connected => info!("NATS connection established"),
                        Event::Disconnected => {
                            warn!("NATS connection lost");
                            let _ = feed.send(BusError::Connection("disconnected".to_string()));
                        }
                        other => {
                            warn!(event = %other, "NATS client event");
                            let _ = feed.send(BusError::Connection(other.to_string()));
                        }
                    }
                }
            })
            .connect(url)
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;

        info!(url = %url, "Connected to NATS");

        Ok(Self {
            url: url.to_string(),
            client,
            subscriptions: SubscriptionTable::new(),
            readers: Mutex::new(HashMap::new()),
            errors,
        })
    }

    async fn start_reader(&self, channel: &str) -> Result<()> {
        let subscribe_error = |message: String| BusError::Subscribe {
            channel: channel.to_string(),
            message,
        };

        let mut subscriber = self
            .client
            .subscribe(channel.to_string())
            .await
            .map_err(|e| subscribe_error(e.to_string()))?;
        // Make sure the server has registered the interest before returning
        self.client
            .flush()
            .await
            .map_err(|e| subscribe_error(e.to_string()))?;

        let subscriptions = self.subscriptions.clone();
        let errors = self.errors.clone();
        let channel_name = channel.to_string();

        let reader = tokio::spawn(async move {
            while let Some(msg) = subscriber.next().await {
                let payload = match String::from_utf8(msg.payload.to_vec()) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(channel = %channel_name, error = %e, "Dropped non-UTF-8 message");
                        continue;
                    }
                };
                let message = Arc::new(BusMessage::new(msg.subject.to_string(), payload));
                dispatch_to_handlers(&subscriptions, message).await;
            }

            error!(channel = %channel_name, "NATS subscription ended");
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
impl Bus for NatsBus {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(channel = %channel))]
    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        self.client
            .publish(channel.to_string(), payload.into())
            .await
            .map_err(|e| BusError::Publish {
                channel: channel.to_string(),
                message: e.to_string(),
            })?;

        debug!("Published message to NATS");
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

        debug!(channel = %channel, "Handler subscribed to NATS bus");
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
            debug!(channel = %channel, "Stopped NATS subscription");
        }
        Ok(())
    }

    fn transport_errors(&self) -> broadcast::Receiver<BusError> {
        self.errors.subscribe()
    }

    async fn fork(&self) -> Result<Arc<dyn Bus>> {
        Ok(Arc::new(NatsBus::connect(&self.url).await?))
    }
}

impl Drop for NatsBus {
    fn drop(&mut self) {
        for (_, reader) in self.readers.get_mut().drain() {
            reader.abort();
        }
    }
}
