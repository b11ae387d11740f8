//! Endpoints: one controller bound to one channel path.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use serde::Serialize;
use tracing::{debug, Instrument};

use crate::bus::{Bus, BusError, BusMessage};
use crate::envelope::{Envelope, EnvelopeError, Params, Reply};
use crate::node::{Node, NodeError};

/// Invalid route or node definitions. Raised at construction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error("Route path must not be empty")]
    EmptyPath,

    #[error("Node id must not be empty")]
    EmptyId,
}

/// Application code behind a route.
///
/// `done` is present only when the sender asked for a reply. The returned
/// future is spawned; nothing awaits its completion.
pub trait Controller: Send + Sync + 'static {
    fn call(&self, envelope: Envelope, done: Option<Done>) -> BoxFuture<'static, ()>;
}

impl<F, Fut> Controller for F
where
    F: Fn(Envelope, Option<Done>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, envelope: Envelope, done: Option<Done>) -> BoxFuture<'static, ()> {
        Box::pin(self(envelope, done))
    }
}

/// A validated path plus its controller, not yet bound to a node.
#[derive(Clone)]
pub struct Route {
    path: String,
    controller: Arc<dyn Controller>,
}

impl Route {
    pub fn new(path: impl Into<String>, controller: impl Controller) -> Result<Self, RegistrationError> {
        Self::from_arc(path, Arc::new(controller))
    }

    /// Route from an async closure. Lets the compiler infer the argument types.
    pub fn from_fn<F, Fut>(path: impl Into<String>, controller: F) -> Result<Self, RegistrationError>
    where
        F: Fn(Envelope, Option<Done>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::new(path, controller)
    }

    pub fn from_arc(
        path: impl Into<String>,
        controller: Arc<dyn Controller>,
    ) -> Result<Self, RegistrationError> {
        let path = path.into();
        if path.trim().is_empty() {
            return Err(RegistrationError::EmptyPath);
        }
        Ok(Self { path, controller })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route").field("path", &self.path).finish()
    }
}

/// A route bound to its owning node.
pub struct Endpoint {
    route: Route,
    owner: Weak<Node>,
}

impl Endpoint {
    pub(crate) fn new(route: Route, owner: Weak<Node>) -> Self {
        Self { route, owner }
    }

    pub fn path(&self) -> &str {
        self.route.path()
    }

    /// The owning node, if it is still alive.
    pub fn instance(&self) -> Option<Arc<Node>> {
        self.owner.upgrade()
    }

    /// Decode and hand a message to the controller.
    ///
    /// Only decoding happens inline; the controller runs in its own task so a
    /// failing or panicking controller cannot take the subscription down.
    pub(crate) fn dispatch(&self, message: &BusMessage) -> Result<(), BusError> {
        let envelope = Envelope::decode(&message.payload).map_err(|e| BusError::Decode {
            channel: message.channel.clone(),
            message: e.to_string(),
        })?;

        let Some(owner) = self.owner.upgrade() else {
            return Ok(());
        };

        owner.lifecycle().on_data(self.path(), &envelope);

        let done = match (&envelope.callback_id, &envelope.from_path) {
            (Some(callback_id), Some(reply_to)) => Some(Done::new(
                owner.bus().clone(),
                callback_id.clone(),
                reply_to.clone(),
            )),
            _ => None,
        };

        debug!(
            parent: owner.span(),
            path = %self.path(),
            expects_reply = done.is_some(),
            "Dispatching to controller"
        );

        let span = owner.span().clone();
        tokio::spawn(self.route.controller.call(envelope, done).instrument(span));
        Ok(())
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("path", &self.route.path)
            .finish_non_exhaustive()
    }
}

/// Reply capability handed to a controller.
///
/// Consumed on use, so a controller replies at most once.
pub struct Done {
    bus: Arc<dyn Bus>,
    callback_id: String,
    reply_to: String,
}

impl Done {
    pub(crate) fn new(bus: Arc<dyn Bus>, callback_id: String, reply_to: String) -> Self {
        Self {
            bus,
            callback_id,
            reply_to,
        }
    }

    pub fn callback_id(&self) -> &str {
        &self.callback_id
    }

    /// Channel the reply is published to.
    pub fn reply_to(&self) -> &str {
        &self.reply_to
    }

    /// Publish `{callbackID, params}` to the sender.
    pub async fn reply(self, params: Params) -> Result<(), NodeError> {
        let payload = Reply::new(self.callback_id, params).encode()?;
        self.bus.publish(&self.reply_to, payload).await?;
        Ok(())
    }

    /// Reply with a single serialized value.
    pub async fn send<T: Serialize>(self, value: &T) -> Result<(), NodeError> {
        let value = serde_json::to_value(value).map_err(EnvelopeError::from)?;
        self.reply(vec![value]).await
    }
}

impl fmt::Debug for Done {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Done")
            .field("callback_id", &self.callback_id)
            .field("reply_to", &self.reply_to)
            .finish()
    }
}
