//! Bus handlers owned by a node.

use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn, Instrument, Span};

use super::{Lifecycle, Node};
use crate::bus::{BusError, BusMessage, MessageHandler};
use crate::envelope::Reply;
use crate::registry::CallbackRegistry;

/// Resolves replies arriving on the node's own id channel.
pub(super) struct ReplyHandler {
    registry: Arc<CallbackRegistry>,
    node_id: String,
}

impl ReplyHandler {
    pub(super) fn new(registry: Arc<CallbackRegistry>, node_id: String) -> Self {
        Self { registry, node_id }
    }
}

impl MessageHandler for ReplyHandler {
    fn handle(&self, message: Arc<BusMessage>) -> BoxFuture<'static, Result<(), BusError>> {
        let registry = self.registry.clone();
        let node_id = self.node_id.clone();

        Box::pin(async move {
            let reply = Reply::decode(&message.payload).map_err(|e| BusError::Decode {
                channel: message.channel.clone(),
                message: e.to_string(),
            })?;

            if !registry.resolve(&reply.callback_id, reply.params).await {
                debug!(
                    node = %node_id,
                    callback_id = %reply.callback_id,
                    "Duplicate or late reply dropped"
                );
            }
            Ok(())
        })
    }
}

/// Hands messages on a route path to whichever endpoint is currently bound.
pub(super) struct RouteHandler {
    node: Weak<Node>,
    path: String,
}

impl RouteHandler {
    pub(super) fn new(node: Weak<Node>, path: String) -> Self {
        Self { node, path }
    }
}

impl MessageHandler for RouteHandler {
    fn handle(&self, message: Arc<BusMessage>) -> BoxFuture<'static, Result<(), BusError>> {
        let node = self.node.clone();
        let path = self.path.clone();

        Box::pin(async move {
            let Some(node) = node.upgrade() else {
                return Ok(());
            };
            if node.is_closed() {
                return Ok(());
            }
            match node.get_route(&path).await {
                Some(endpoint) => endpoint.dispatch(&message),
                None => Ok(()),
            }
        })
    }
}

/// Forward transport errors to the lifecycle until aborted or the feed closes.
pub(super) fn spawn_error_watcher(
    mut errors: broadcast::Receiver<BusError>,
    lifecycle: Arc<dyn Lifecycle>,
    span: Span,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            loop {
                match errors.recv().await {
                    Ok(error) => {
                        warn!(error = %error, "Bus transport error");
                        lifecycle.on_error(&error);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Transport error feed lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
        .instrument(span),
    )
}
