use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, info_span};

use super::handlers::{spawn_error_watcher, ReplyHandler};
use super::{Lifecycle, Node, NodeError, NodeIdentity, NoopLifecycle};
use crate::bus::MessageHandler;
use crate::bus::Bus;
use crate::endpoint::{RegistrationError, Route};
use crate::id::gen_id;
use crate::registry::CallbackRegistry;

/// Builder for [`Node`].
///
/// `build` subscribes the node to its own id, binds the routes, and fires
/// `on_ready` once all of that succeeded.
pub struct NodeBuilder {
    bus: Arc<dyn Bus>,
    registry: Arc<CallbackRegistry>,
    id: Option<String>,
    tag_name: Option<String>,
    container: Option<String>,
    lifecycle: Arc<dyn Lifecycle>,
    values: HashMap<String, Value>,
    routes: Vec<Route>,
}

impl NodeBuilder {
    pub(crate) fn new(bus: Arc<dyn Bus>, registry: Arc<CallbackRegistry>) -> Self {
        Self {
            bus,
            registry,
            id: None,
            tag_name: None,
            container: None,
            lifecycle: Arc::new(NoopLifecycle),
            values: HashMap::new(),
            routes: Vec::new(),
        }
    }

    /// Use a fixed id instead of a random one.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn tag_name(mut self, tag_name: impl Into<String>) -> Self {
        self.tag_name = Some(tag_name.into());
        self
    }

    /// Name shown in log output. Defaults to the tag name.
    pub fn container(mut self, name: impl Into<String>) -> Self {
        self.container = Some(name.into());
        self
    }

    pub fn lifecycle(mut self, lifecycle: Arc<dyn Lifecycle>) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    /// Seed the scratch store.
    pub fn values(mut self, values: HashMap<String, Value>) -> Self {
        self.values.extend(values);
        self
    }

    pub fn route(mut self, route: Route) -> Self {
        self.routes.push(route);
        self
    }

    pub fn routes(mut self, routes: impl IntoIterator<Item = Route>) -> Self {
        self.routes.extend(routes);
        self
    }

    pub async fn build(self) -> Result<Arc<Node>, NodeError> {
        let id = match self.id {
            Some(id) if id.trim().is_empty() => return Err(RegistrationError::EmptyId.into()),
            Some(id) => id,
            None => gen_id(self.registry.config().id_bytes),
        };
        let tag_name = self.tag_name.unwrap_or_else(|| id.clone());
        let container = self.container.unwrap_or_else(|| tag_name.clone());
        let span = info_span!("node", container = %container, id = %id, tag = %tag_name);

        // Subscribe to the error feed first so nothing raised during setup is missed
        let errors = self.bus.transport_errors();

        let node = Arc::new_cyclic(|this| Node {
            identity: NodeIdentity {
                id: id.clone(),
                tag_name,
            },
            bus: self.bus.clone(),
            registry: self.registry.clone(),
            routes: RwLock::new(HashMap::new()),
            values: RwLock::new(self.values),
            lifecycle: self.lifecycle.clone(),
            span: span.clone(),
            error_watcher: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            this: this.clone(),
        });

        let replies: Arc<dyn MessageHandler> =
            Arc::new(ReplyHandler::new(self.registry, id.clone()));
        self.bus.subscribe(&id, replies.clone()).await?;
        node.subscriptions.lock().await.push((id.clone(), replies));

        let watcher = spawn_error_watcher(errors, self.lifecycle, span.clone());
        *node.error_watcher.lock().await = Some(watcher);

        for route in self.routes {
            if let Err(e) = node.add_route(route).await {
                // Undo the subscriptions made so far
                node.release().await;
                return Err(e);
            }
        }

        info!(parent: &span, "Node ready");
        node.lifecycle.on_ready(&node.identity);

        Ok(node)
    }
}
