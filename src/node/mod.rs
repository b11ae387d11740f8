//! Addressable node.
//!
//! A node has an id (its reply channel), a route table of endpoints, a local
//! scratch store and lifecycle hooks. `send_to` is the outbound primitive:
//! with a continuation it registers a callback and stamps the request with
//! `callbackID`/`fromPath`, without one it is a plain publish.

mod builder;
mod handlers;

pub use builder::NodeBuilder;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Span};

use crate::bus::{Bus, BusError, MessageHandler};
use crate::endpoint::{Done, Endpoint, RegistrationError, Route};
use crate::envelope::{Envelope, EnvelopeError, Params};
use crate::registry::{CallbackError, CallbackRegistry, Continuation};
use handlers::RouteHandler;

/// Errors from node operations.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Registration error: {0}")]
    Registration(#[from] RegistrationError),

    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("Callback error: {0}")]
    Callback(#[from] CallbackError),

    #[error("Node {0} is closed")]
    Closed(String),
}

/// Who a node is. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    /// Globally unique id; also the node's reply channel.
    pub id: String,
    /// Human-readable name. Defaults to `id`.
    pub tag_name: String,
}

/// Lifecycle hooks. All methods default to no-ops.
pub trait Lifecycle: Send + Sync {
    /// Construction and route registration finished.
    fn on_ready(&self, _node: &NodeIdentity) {}

    /// One of the node's endpoints accepted an inbound envelope.
    fn on_data(&self, _path: &str, _envelope: &Envelope) {}

    /// The bus reported a transport error.
    fn on_error(&self, _error: &BusError) {}

    /// The node was closed.
    fn on_close(&self, _node: &NodeIdentity) {}
}

/// Lifecycle that ignores every event.
pub struct NoopLifecycle;

impl Lifecycle for NoopLifecycle {}

pub struct Node {
    identity: NodeIdentity,
    bus: Arc<dyn Bus>,
    registry: Arc<CallbackRegistry>,
    routes: RwLock<HashMap<String, Arc<Endpoint>>>,
    values: RwLock<HashMap<String, Value>>,
    lifecycle: Arc<dyn Lifecycle>,
    span: Span,
    error_watcher: Mutex<Option<JoinHandle<()>>>,
    /// Every handler this node put on the bus, for `close`.
    subscriptions: Mutex<Vec<(String, Arc<dyn MessageHandler>)>>,
    closed: AtomicBool,
    this: Weak<Node>,
}

impl Node {
    /// Start building a node on `bus`, correlating replies through `registry`.
    pub fn builder(bus: Arc<dyn Bus>, registry: Arc<CallbackRegistry>) -> NodeBuilder {
        NodeBuilder::new(bus, registry)
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn id(&self) -> &str {
        &self.identity.id
    }

    pub fn tag_name(&self) -> &str {
        &self.identity.tag_name
    }

    pub fn bus(&self) -> &Arc<dyn Bus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<CallbackRegistry> {
        &self.registry
    }

    pub fn lifecycle(&self) -> &Arc<dyn Lifecycle> {
        &self.lifecycle
    }

    /// Span carrying this node's container name, id and tag.
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Routes
    // ------------------------------------------------------------------

    /// Bind an async closure at `path`.
    ///
    /// Re-registering a path replaces the previous binding.
    pub async fn set_route<F, Fut>(&self, path: &str, controller: F) -> Result<Arc<Endpoint>, NodeError>
    where
        F: Fn(Envelope, Option<Done>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add_route(Route::new(path, controller)?).await
    }

    /// Bind a validated route.
    ///
    /// The node subscribes to each path once; dispatch looks up the current
    /// endpoint, so a replacement takes effect for the next message.
    pub async fn add_route(&self, route: Route) -> Result<Arc<Endpoint>, NodeError> {
        let path = route.path().to_string();
        let endpoint = Arc::new(Endpoint::new(route, self.this.clone()));

        let previous = self
            .routes
            .write()
            .await
            .insert(path.clone(), endpoint.clone());

        if previous.is_some() {
            info!(parent: &self.span, path = %path, "Route replaced");
            return Ok(endpoint);
        }

        let handler: Arc<dyn MessageHandler> =
            Arc::new(RouteHandler::new(self.this.clone(), path.clone()));
        if let Err(e) = self.bus.subscribe(&path, handler.clone()).await {
            self.routes.write().await.remove(&path);
            return Err(e.into());
        }
        self.subscriptions.lock().await.push((path.clone(), handler));

        info!(parent: &self.span, path = %path, "Route registered");
        Ok(endpoint)
    }

    pub async fn get_route(&self, path: &str) -> Option<Arc<Endpoint>> {
        self.routes.read().await.get(path).cloned()
    }

    /// Registered paths, sorted.
    pub async fn routes(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.routes.read().await.keys().cloned().collect();
        paths.sort();
        paths
    }

    // ------------------------------------------------------------------
    // Scratch store
    // ------------------------------------------------------------------

    pub async fn set_value(&self, key: impl Into<String>, value: Value) {
        self.values.write().await.insert(key.into(), value);
    }

    pub async fn get_value(&self, key: &str) -> Option<Value> {
        self.values.read().await.get(key).cloned()
    }

    pub async fn delete_value(&self, key: &str) -> Option<Value> {
        self.values.write().await.remove(key)
    }

    /// Copy of the whole scratch store.
    pub async fn values(&self) -> HashMap<String, Value> {
        self.values.read().await.clone()
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Publish `envelope` to `path`.
    ///
    /// With a continuation, registers a callback (registry default timeout),
    /// stamps `callbackID`/`fromPath` and returns the callback id. Without one
    /// the envelope is published as-is and nothing is registered.
    pub async fn send_to(
        &self,
        path: &str,
        envelope: Envelope,
        callback: Option<Continuation>,
    ) -> Result<Option<String>, NodeError> {
        match callback {
            Some(continuation) => self
                .send_correlated(path, envelope, continuation, None)
                .await
                .map(Some),
            None => {
                self.notify(path, envelope).await?;
                Ok(None)
            }
        }
    }

    /// Correlated send with an explicit reply timeout.
    pub async fn send_to_with_timeout(
        &self,
        path: &str,
        envelope: Envelope,
        timeout: Duration,
        callback: Continuation,
    ) -> Result<String, NodeError> {
        self.send_correlated(path, envelope, callback, Some(timeout))
            .await
    }

    /// Fire-and-forget publish.
    pub async fn notify(&self, path: &str, envelope: Envelope) -> Result<(), NodeError> {
        self.ensure_open()?;
        let payload = envelope.encode()?;
        self.bus.publish(path, payload).await?;
        debug!(parent: &self.span, path = %path, "Notification sent");
        Ok(())
    }

    /// Send and wait for the reply params.
    ///
    /// `timeout` overrides the registry default; with neither, this waits
    /// until a reply arrives.
    pub async fn request(
        &self,
        path: &str,
        envelope: Envelope,
        timeout: Option<Duration>,
    ) -> Result<Params, NodeError> {
        let (tx, rx) = oneshot::channel();
        let continuation: Continuation = Box::new(move |outcome| {
            let _ = tx.send(outcome);
        });

        let callback_id = self
            .send_correlated(path, envelope, continuation, timeout)
            .await?;

        match rx.await {
            Ok(outcome) => Ok(outcome?),
            // Continuation dropped unrun: the registry went away
            Err(_) => Err(CallbackError::Cancelled(callback_id).into()),
        }
    }

    async fn send_correlated(
        &self,
        path: &str,
        mut envelope: Envelope,
        continuation: Continuation,
        timeout: Option<Duration>,
    ) -> Result<String, NodeError> {
        self.ensure_open()?;

        let callback_id = self.registry.register(continuation, timeout).await;
        envelope.stamp(callback_id.clone(), self.identity.id.clone());

        let published = match envelope.encode() {
            Ok(payload) => self.bus.publish(path, payload).await.map_err(NodeError::from),
            Err(e) => Err(e.into()),
        };

        if let Err(e) = published {
            self.registry.discard(&callback_id).await;
            return Err(e);
        }

        debug!(
            parent: &self.span,
            path = %path,
            callback_id = %callback_id,
            "Request sent"
        );
        Ok(callback_id)
    }

    fn ensure_open(&self) -> Result<(), NodeError> {
        if self.is_closed() {
            return Err(NodeError::Closed(self.identity.id.clone()));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Stop serving routes and forwarding transport errors, then fire `on_close`.
    ///
    /// The node's reply and route handlers are removed from the bus.
    /// Idempotent. Outstanding callbacks stay in the registry.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.release().await;

        info!(parent: &self.span, "Node closed");
        self.lifecycle.on_close(&self.identity);
    }

    /// Stop the error watcher and take every handler of this node off the bus.
    pub(crate) async fn release(&self) {
        if let Some(watcher) = self.error_watcher.lock().await.take() {
            watcher.abort();
        }

        let subscriptions = std::mem::take(&mut *self.subscriptions.lock().await);
        for (channel, handler) in subscriptions {
            if let Err(e) = self.bus.unsubscribe(&channel, &handler).await {
                warn!(parent: &self.span, channel = %channel, error = %e, "Failed to unsubscribe");
            }
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Some(watcher) = self.error_watcher.get_mut().take() {
            watcher.abort();
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("identity", &self.identity)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;
