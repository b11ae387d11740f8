//! Cores: the runtime of one worker process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tracing::{error, info};

use super::thread::{spawn_thread, ThreadDefinition, ThreadHandle};
use super::{NoopHooks, SupervisorContext, SupervisorError, SupervisorHooks, UnitExit};
use crate::endpoint::Route;
use crate::service::Service;

/// Core lifecycle, worker side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreState {
    Initializing,
    Attached,
    Ready,
    Closed,
}

/// What one worker process runs.
#[derive(Clone)]
pub struct CoreDefinition {
    pub tag_name: String,
    pub routes: Vec<Route>,
    pub values: HashMap<String, Value>,
    pub threads: Vec<ThreadDefinition>,
    pub hooks: Arc<dyn SupervisorHooks>,
}

impl CoreDefinition {
    pub fn new(tag_name: impl Into<String>) -> Self {
        Self {
            tag_name: tag_name.into(),
            routes: Vec::new(),
            values: HashMap::new(),
            threads: Vec::new(),
            hooks: Arc::new(NoopHooks),
        }
    }

    pub fn route(mut self, route: Route) -> Self {
        self.routes.push(route);
        self
    }

    /// Seed the core service's scratch store. Threads get a copy.
    pub fn value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    pub fn thread(mut self, thread: ThreadDefinition) -> Self {
        self.threads.push(thread);
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn SupervisorHooks>) -> Self {
        self.hooks = hooks;
        self
    }
}

impl std::fmt::Debug for CoreDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreDefinition")
            .field("tag_name", &self.tag_name)
            .field("routes", &self.routes)
            .field("threads", &self.threads)
            .finish_non_exhaustive()
    }
}

/// A core attached in its worker process.
pub struct Core {
    tag_name: String,
    service: Arc<Service>,
    threads: Mutex<Vec<ThreadHandle>>,
    hooks: Arc<dyn SupervisorHooks>,
    state: watch::Sender<CoreState>,
    closing: AtomicBool,
}

impl Core {
    /// Build the core's service, start its threads, then fire `on_ready`.
    ///
    /// Each thread receives a copy of the service's scratch store as it is
    /// at spawn time.
    pub async fn attach(
        definition: &CoreDefinition,
        context: &SupervisorContext,
    ) -> Result<Arc<Self>, SupervisorError> {
        let tag = definition.tag_name.clone();
        let hooks = definition.hooks.clone();
        let (state, _) = watch::channel(CoreState::Initializing);

        let service = Service::builder(tag.clone(), context.bus.clone(), context.registry.clone())
            .tag_name(tag.clone())
            .values(definition.values.clone())
            .routes(definition.routes.clone())
            .build()
            .await
            .map_err(|e| {
                let err = SupervisorError::from(e);
                error!(tag = %tag, error = %err, "Core failed to attach");
                hooks.on_error(&tag, &err);
                err
            })?;

        let core = Arc::new(Self {
            tag_name: tag.clone(),
            service: Arc::new(service),
            threads: Mutex::new(Vec::new()),
            hooks: hooks.clone(),
            state,
            closing: AtomicBool::new(false),
        });
        core.transition(CoreState::Attached);

        for thread in &definition.threads {
            let snapshot = core.service.values().await;
            let handle = spawn_thread(
                thread.clone(),
                context.bus.clone(),
                context.registry.clone(),
                snapshot,
                hooks.clone(),
            )
            .await?;
            core.threads.lock().await.push(handle);
        }

        core.transition(CoreState::Ready);
        info!(tag = %tag, threads = definition.threads.len(), "Core ready");
        hooks.on_ready(&tag);

        Ok(core)
    }

    pub fn tag_name(&self) -> &str {
        &self.tag_name
    }

    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    pub fn state(&self) -> CoreState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<CoreState> {
        self.state.subscribe()
    }

    /// Tags of threads whose exit has not been reported yet.
    pub async fn running_threads(&self) -> Vec<String> {
        self.threads
            .lock()
            .await
            .iter()
            .filter(|handle| !handle.is_finished())
            .map(|handle| handle.tag_name().to_string())
            .collect()
    }

    /// Stop every thread, close the service and fire `on_close`.
    pub async fn shutdown(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }

        let threads = std::mem::take(&mut *self.threads.lock().await);
        for handle in threads {
            handle.stop().await;
        }

        self.service.close().await;
        self.transition(CoreState::Closed);
        info!(tag = %self.tag_name, "Core closed");
        self.hooks.on_close(&self.tag_name, &UnitExit::Returned);
    }

    fn transition(&self, next: CoreState) {
        info!(tag = %self.tag_name, state = ?next, "Core state changed");
        self.state.send_replace(next);
    }
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("tag_name", &self.tag_name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
