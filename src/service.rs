//! Services: named nodes that aggregate routes.
//!
//! A service is built from a container name and a list of routes. It derefs
//! to its [`Node`], so `send_to`, `request` and the scratch store are used
//! directly on the service.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

use serde_json::Value;
use tracing::Span;

use crate::bus::Bus;
use crate::endpoint::Route;
use crate::node::{Lifecycle, Node, NodeBuilder, NodeError};
use crate::registry::CallbackRegistry;

pub struct Service {
    name: String,
    node: Arc<Node>,
}

impl Service {
    pub fn builder(
        name: impl Into<String>,
        bus: Arc<dyn Bus>,
        registry: Arc<CallbackRegistry>,
    ) -> ServiceBuilder {
        let name = name.into();
        ServiceBuilder {
            node: Node::builder(bus, registry).container(name.clone()),
            name,
        }
    }

    /// Container name used in log output.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Run `f` inside this service's logging span.
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        self.span().in_scope(f)
    }

    pub fn span(&self) -> &Span {
        self.node.span()
    }
}

impl Deref for Service {
    type Target = Node;

    fn deref(&self) -> &Node {
        &self.node
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("node", &self.node)
            .finish()
    }
}

/// Builder for [`Service`].
pub struct ServiceBuilder {
    name: String,
    node: NodeBuilder,
}

impl ServiceBuilder {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.node = self.node.id(id);
        self
    }

    pub fn tag_name(mut self, tag_name: impl Into<String>) -> Self {
        self.node = self.node.tag_name(tag_name);
        self
    }

    pub fn route(mut self, route: Route) -> Self {
        self.node = self.node.route(route);
        self
    }

    pub fn routes(mut self, routes: impl IntoIterator<Item = Route>) -> Self {
        self.node = self.node.routes(routes);
        self
    }

    pub fn lifecycle(mut self, lifecycle: Arc<dyn Lifecycle>) -> Self {
        self.node = self.node.lifecycle(lifecycle);
        self
    }

    pub fn value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.node = self.node.value(key, value);
        self
    }

    pub fn values(mut self, values: HashMap<String, Value>) -> Self {
        self.node = self.node.values(values);
        self
    }

    /// Bind every route, then fire `on_ready` before returning.
    pub async fn build(self) -> Result<Service, NodeError> {
        let node = self.node.build().await?;
        Ok(Service {
            name: self.name,
            node,
        })
    }
}
