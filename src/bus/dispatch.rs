//! Handler dispatch utilities.
//!
//! Provides the subscription table shared by the bus implementations and the
//! common pattern for dispatching a message to every handler on its channel.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{BusError, BusMessage, MessageHandler};

/// Handlers registered per channel.
#[derive(Clone, Default)]
pub(crate) struct SubscriptionTable {
    inner: Arc<RwLock<HashMap<String, Vec<Arc<dyn MessageHandler>>>>>,
}

impl SubscriptionTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Returns `true` if this is the first handler on the channel.
    pub(crate) async fn add(&self, channel: &str, handler: Arc<dyn MessageHandler>) -> bool {
        let mut table = self.inner.write().await;
        let handlers = table.entry(channel.to_string()).or_default();
        handlers.push(handler);
        handlers.len() == 1
    }

    /// Remove one handler, matched by identity.
    ///
    /// Returns `true` if it was the last handler on the channel; the channel
    /// entry is dropped so the next `add` counts as first again.
    pub(crate) async fn remove(&self, channel: &str, handler: &Arc<dyn MessageHandler>) -> bool {
        let mut table = self.inner.write().await;
        let Some(handlers) = table.get_mut(channel) else {
            return false;
        };
        handlers.retain(|existing| !same_handler(existing, handler));
        if handlers.is_empty() {
            table.remove(channel);
            return true;
        }
        false
    }

    /// Handlers for a channel, cloned out so no lock is held while they run.
    pub(crate) async fn handlers_for(&self, channel: &str) -> Vec<Arc<dyn MessageHandler>> {
        self.inner
            .read()
            .await
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) async fn is_subscribed(&self, channel: &str) -> bool {
        self.inner.read().await.contains_key(channel)
    }

    pub(crate) async fn channel_count(&self) -> usize {
        self.inner.read().await.len()
    }
}

fn same_handler(a: &Arc<dyn MessageHandler>, b: &Arc<dyn MessageHandler>) -> bool {
    // Compare data pointers only; vtable pointers are not unique
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Dispatch a message to all handlers subscribed to its channel.
///
/// Calls each handler in sequence, logging errors but continuing to subsequent
/// handlers. Returns `true` if all handlers succeeded, `false` if any failed.
/// Messages on channels without handlers are ignored.
pub(crate) async fn dispatch_to_handlers(
    table: &SubscriptionTable,
    message: Arc<BusMessage>,
) -> bool {
    let handlers = table.handlers_for(&message.channel).await;
    if handlers.is_empty() {
        return true;
    }

    debug!(
        channel = %message.channel,
        handlers = handlers.len(),
        "Dispatching message"
    );

    let mut all_succeeded = true;
    for handler in handlers {
        if let Err(e) = handler.handle(Arc::clone(&message)).await {
            log_handler_error(&message.channel, &e);
            all_succeeded = false;
        }
    }

    all_succeeded
}

fn log_handler_error(channel: &str, error: &BusError) {
    match error {
        BusError::Decode { .. } => {
            warn!(channel = %channel, error = %error, "Dropped malformed message")
        }
        _ => warn!(channel = %channel, error = %error, "Handler failed"),
    }
}
