//! Worker threads.
//!
//! Two entry points: [`spawn_thread`] runs on the parent and starts the OS
//! thread; [`attach_to_parent_snapshot`] runs inside it and builds the
//! thread's own service from the copied scratch store.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::{SupervisorError, SupervisorHooks, UnitExit};
use crate::bus::Bus;
use crate::endpoint::Route;
use crate::node::NodeError;
use crate::registry::CallbackRegistry;
use crate::service::Service;

/// Body run once the thread's service is attached.
pub type ThreadMain = Arc<dyn Fn(ThreadContext) -> BoxFuture<'static, ()> + Send + Sync>;

/// What a thread serves.
#[derive(Clone)]
pub struct ThreadDefinition {
    pub tag_name: String,
    pub routes: Vec<Route>,
    pub main: Option<ThreadMain>,
}

impl ThreadDefinition {
    pub fn new(tag_name: impl Into<String>) -> Self {
        Self {
            tag_name: tag_name.into(),
            routes: Vec::new(),
            main: None,
        }
    }

    pub fn route(mut self, route: Route) -> Self {
        self.routes.push(route);
        self
    }

    /// Run `main` after attachment. The thread keeps serving its routes
    /// after `main` returns, until it is stopped.
    pub fn main<F, Fut>(mut self, main: F) -> Self
    where
        F: Fn(ThreadContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.main = Some(Arc::new(move |ctx: ThreadContext| -> BoxFuture<'static, ()> {
            Box::pin(main(ctx))
        }));
        self
    }
}

impl std::fmt::Debug for ThreadDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadDefinition")
            .field("tag_name", &self.tag_name)
            .field("routes", &self.routes)
            .field("main", &self.main.is_some())
            .finish()
    }
}

/// Handed to a thread's `main`.
pub struct ThreadContext {
    service: Arc<Service>,
    shutdown: watch::Receiver<bool>,
}

impl ThreadContext {
    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    pub fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once the thread is asked to stop.
    pub async fn stopped(&mut self) {
        wait_for_shutdown(&mut self.shutdown).await;
    }
}

/// Parent-side handle on a running thread.
pub struct ThreadHandle {
    tag_name: String,
    shutdown: watch::Sender<bool>,
    monitor: JoinHandle<()>,
}

impl ThreadHandle {
    pub fn tag_name(&self) -> &str {
        &self.tag_name
    }

    pub fn is_finished(&self) -> bool {
        self.monitor.is_finished()
    }

    /// Ask the thread to stop and wait until its exit has been reported.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.monitor.await {
            warn!(tag = %self.tag_name, error = %e, "Thread monitor failed");
        }
    }
}

/// Start `definition` on a dedicated OS thread.
///
/// Returns once the thread has attached its service, after `on_ready` fired
/// for the thread's tag. Exit and panics are later reported through `hooks`.
pub async fn spawn_thread(
    definition: ThreadDefinition,
    bus: Arc<dyn Bus>,
    registry: Arc<CallbackRegistry>,
    snapshot: HashMap<String, Value>,
    hooks: Arc<dyn SupervisorHooks>,
) -> Result<ThreadHandle, SupervisorError> {
    let tag = definition.tag_name.clone();
    let (attached_tx, attached_rx) = oneshot::channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let join = std::thread::Builder::new()
        .name(format!("switchboard-{}", tag))
        .spawn(move || run_thread(definition, bus, registry, snapshot, attached_tx, shutdown_rx))
        .map_err(|source| {
            let err = SupervisorError::ThreadSpawn {
                tag: tag.clone(),
                source,
            };
            hooks.on_error(&tag, &err);
            err
        })?;

    let attached = attached_rx.await;
    let monitor = tokio::spawn(monitor_thread(tag.clone(), join, hooks.clone()));

    match attached {
        Ok(Ok(())) => {
            info!(tag = %tag, "Thread online");
            hooks.on_ready(&tag);
            Ok(ThreadHandle {
                tag_name: tag,
                shutdown: shutdown_tx,
                monitor,
            })
        }
        Ok(Err(err)) => {
            error!(tag = %tag, error = %err, "Thread failed to attach");
            hooks.on_error(&tag, &err);
            let _ = monitor.await;
            Err(err)
        }
        // Thread died before attaching; the monitor reports the panic
        Err(_) => {
            let _ = monitor.await;
            Err(SupervisorError::ThreadFailed {
                tag,
                message: "thread exited before attaching".to_string(),
            })
        }
    }
}

/// Build the thread's service from the parent's scratch store snapshot.
///
/// Runs inside the spawned thread. Opens a separate bus handle so the
/// thread's subscriptions live on its own runtime.
pub async fn attach_to_parent_snapshot(
    definition: &ThreadDefinition,
    bus: Arc<dyn Bus>,
    registry: Arc<CallbackRegistry>,
    snapshot: HashMap<String, Value>,
) -> Result<Arc<Service>, SupervisorError> {
    let bus = bus.fork().await.map_err(NodeError::from)?;

    let service = Service::builder(definition.tag_name.clone(), bus, registry)
        .tag_name(definition.tag_name.clone())
        .values(snapshot)
        .routes(definition.routes.clone())
        .build()
        .await?;

    Ok(Arc::new(service))
}

fn run_thread(
    definition: ThreadDefinition,
    bus: Arc<dyn Bus>,
    registry: Arc<CallbackRegistry>,
    snapshot: HashMap<String, Value>,
    attached: oneshot::Sender<Result<(), SupervisorError>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(source) => {
            let _ = attached.send(Err(SupervisorError::ThreadSpawn {
                tag: definition.tag_name.clone(),
                source,
            }));
            return;
        }
    };

    runtime.block_on(async move {
        let service = match attach_to_parent_snapshot(&definition, bus, registry, snapshot).await {
            Ok(service) => service,
            Err(err) => {
                let _ = attached.send(Err(err));
                return;
            }
        };
        let _ = attached.send(Ok(()));

        if let Some(main) = &definition.main {
            main(ThreadContext {
                service: service.clone(),
                shutdown: shutdown.clone(),
            })
            .await;
        }

        wait_for_shutdown(&mut shutdown).await;
        service.close().await;
    });
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        // Sender dropped: the parent is gone, stop as well
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}

async fn monitor_thread(
    tag: String,
    join: std::thread::JoinHandle<()>,
    hooks: Arc<dyn SupervisorHooks>,
) {
    let exit = match tokio::task::spawn_blocking(move || join.join()).await {
        Ok(Ok(())) => UnitExit::Returned,
        Ok(Err(panic)) => UnitExit::Panicked(panic_message(panic.as_ref())),
        Err(e) => UnitExit::Panicked(e.to_string()),
    };

    if let UnitExit::Panicked(message) = &exit {
        error!(tag = %tag, panic = %message, "Thread panicked");
        hooks.on_error(
            &tag,
            &SupervisorError::ThreadFailed {
                tag: tag.clone(),
                message: message.clone(),
            },
        );
    } else {
        info!(tag = %tag, "Thread exited");
    }

    hooks.on_close(&tag, &exit);
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_extracts_text() {
        let str_panic: Box<dyn Any + Send> = Box::new("boom");
        let string_panic: Box<dyn Any + Send> = Box::new(String::from("bang"));
        let other: Box<dyn Any + Send> = Box::new(7u8);

        assert_eq!(panic_message(str_panic.as_ref()), "boom");
        assert_eq!(panic_message(string_panic.as_ref()), "bang");
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }

    #[test]
    fn test_definition_builder() {
        let definition = ThreadDefinition::new("t1")
            .route(Route::from_fn("/t", |_envelope, _done| async {}).unwrap())
            .main(|_ctx| async {});

        assert_eq!(definition.tag_name, "t1");
        assert_eq!(definition.routes.len(), 1);
        assert!(definition.main.is_some());
    }
}
