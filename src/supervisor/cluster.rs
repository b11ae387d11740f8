//! Clusters: the root of the supervisor tree.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::core::{Core, CoreDefinition};
use super::process::{ManagedProcess, WorkerCommand};
use super::{NoopHooks, Role, SupervisorContext, SupervisorError, SupervisorHooks, UnitExit};
use crate::config::SupervisorConfig;
use crate::endpoint::Route;
use crate::service::Service;

/// Cluster lifecycle.
///
/// Master: `Initializing → Forking → WaitingForReady → Ready`, or `Error`
/// when a core cannot be spawned. Worker: `Initializing → WorkerAttached →
/// Ready`. `Stopped` follows `shutdown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    Initializing,
    Forking,
    WaitingForReady,
    WorkerAttached,
    Ready,
    Error,
    Stopped,
}

/// Master-side record of a spawned core process.
struct CoreRecord {
    tag_name: String,
    pid: Option<u32>,
    stop: Option<oneshot::Sender<()>>,
    supervisor: JoinHandle<()>,
}

pub struct Cluster {
    tag_name: String,
    routes: Vec<Route>,
    values: HashMap<String, Value>,
    cores: Vec<CoreDefinition>,
    hooks: Arc<dyn SupervisorHooks>,
    context: SupervisorContext,
    config: SupervisorConfig,
    state: watch::Sender<ClusterState>,
    records: Mutex<Vec<CoreRecord>>,
    attached: Mutex<Option<Arc<Core>>>,
    service: Mutex<Option<Arc<Service>>>,
}

impl Cluster {
    pub fn builder(context: SupervisorContext) -> ClusterBuilder {
        ClusterBuilder {
            tag_name: "cluster".to_string(),
            routes: Vec::new(),
            values: HashMap::new(),
            cores: Vec::new(),
            hooks: Arc::new(NoopHooks),
            context,
            config: SupervisorConfig::default(),
        }
    }

    pub fn tag_name(&self) -> &str {
        &self.tag_name
    }

    pub fn state(&self) -> ClusterState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ClusterState> {
        self.state.subscribe()
    }

    /// Start in the role this process was launched in.
    pub async fn start_detected(&self) -> Result<(), SupervisorError> {
        self.start(Role::detect()).await
    }

    pub async fn start(&self, role: Role) -> Result<(), SupervisorError> {
        if self.state() != ClusterState::Initializing {
            return Err(SupervisorError::AlreadyStarted);
        }

        match role {
            Role::Master => self.start_master().await,
            Role::Worker(tag) => self.start_worker(&tag).await,
        }
    }

    /// Core processes spawned by this master.
    pub async fn online_cores(&self) -> usize {
        self.records.lock().await.len()
    }

    /// `(tag, pid)` of every spawned core process.
    pub async fn core_processes(&self) -> Vec<(String, Option<u32>)> {
        self.records
            .lock()
            .await
            .iter()
            .map(|record| (record.tag_name.clone(), record.pid))
            .collect()
    }

    /// The core attached in this worker process.
    pub async fn attached_core(&self) -> Option<Arc<Core>> {
        self.attached.lock().await.clone()
    }

    /// The master's own service, serving the cluster routes.
    ///
    /// Present once the master has started; workers only serve their core.
    pub async fn service(&self) -> Option<Arc<Service>> {
        self.service.lock().await.clone()
    }

    /// Stop everything this cluster started.
    ///
    /// Master: SIGTERM each core's process group, SIGKILL after the
    /// configured grace period, and wait for exits to be reported.
    /// Worker: shut the attached core down.
    pub async fn shutdown(&self) {
        let mut records = std::mem::take(&mut *self.records.lock().await);
        for record in &mut records {
            if let Some(stop) = record.stop.take() {
                let _ = stop.send(());
            }
        }
        for record in records {
            if let Err(e) = record.supervisor.await {
                warn!(tag = %record.tag_name, error = %e, "Core supervisor task failed");
            }
        }

        if let Some(core) = self.attached.lock().await.take() {
            core.shutdown().await;
        }

        if let Some(service) = self.service.lock().await.take() {
            service.close().await;
        }

        self.transition(ClusterState::Stopped);
    }

    async fn start_master(&self) -> Result<(), SupervisorError> {
        let service = Service::builder(
            self.tag_name.clone(),
            self.context.bus.clone(),
            self.context.registry.clone(),
        )
        .tag_name(self.tag_name.clone())
        .values(self.values.clone())
        .routes(self.routes.clone())
        .build()
        .await
        .map_err(|e| self.fail(SupervisorError::from(e)))?;
        *self.service.lock().await = Some(Arc::new(service));

        if self.cores.is_empty() {
            info!(tag = %self.tag_name, "No cores defined, nothing to fork");
            self.become_ready();
            return Ok(());
        }

        self.transition(ClusterState::Forking);

        let command = WorkerCommand::from_config(&self.config).map_err(|source| {
            self.fail(SupervisorError::Spawn {
                tag: self.tag_name.clone(),
                source,
            })
        })?;

        for definition in &self.cores {
            let tag = definition.tag_name.clone();
            let process = ManagedProcess::spawn(&tag, &command)
                .map_err(|source| self.fail(SupervisorError::Spawn { tag: tag.clone(), source }))?;

            let (stop_tx, stop_rx) = oneshot::channel();
            let pid = process.pid();
            let supervisor = tokio::spawn(supervise(
                tag.clone(),
                process,
                stop_rx,
                self.config.shutdown_grace(),
                [self.hooks.clone(), definition.hooks.clone()],
            ));

            self.records.lock().await.push(CoreRecord {
                tag_name: tag,
                pid,
                stop: Some(stop_tx),
                supervisor,
            });
        }

        self.transition(ClusterState::WaitingForReady);

        // A spawned core counts as online
        if self.online_cores().await == self.cores.len() {
            self.become_ready();
        }
        Ok(())
    }

    async fn start_worker(&self, tag: &str) -> Result<(), SupervisorError> {
        let Some(definition) = self.cores.iter().find(|core| core.tag_name == tag) else {
            error!(tag = %tag, "No core definition matches this worker's tag");
            self.transition(ClusterState::Error);
            return Err(SupervisorError::UnknownCore(tag.to_string()));
        };

        self.transition(ClusterState::WorkerAttached);

        let core = Core::attach(definition, &self.context).await.map_err(|e| {
            self.transition(ClusterState::Error);
            e
        })?;
        *self.attached.lock().await = Some(core);

        self.become_ready();
        Ok(())
    }

    fn become_ready(&self) {
        self.transition(ClusterState::Ready);
        self.hooks.on_ready(&self.tag_name);
    }

    /// Enter the error state and report `err` (master only).
    fn fail(&self, err: SupervisorError) -> SupervisorError {
        error!(tag = %self.tag_name, error = %err, "Cluster failed");
        self.transition(ClusterState::Error);
        self.hooks.on_error(&self.tag_name, &err);
        err
    }

    fn transition(&self, next: ClusterState) {
        info!(tag = %self.tag_name, state = ?next, "Cluster state changed");
        self.state.send_replace(next);
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("tag_name", &self.tag_name)
            .field("cores", &self.cores)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Relay a core process's exit to the cluster and core hooks.
async fn supervise(
    tag: String,
    mut process: ManagedProcess,
    mut stop: oneshot::Receiver<()>,
    grace: Duration,
    hooks: [Arc<dyn SupervisorHooks>; 2],
) {
    // A dropped sender means the cluster is gone: stop as well
    let exited = tokio::select! {
        status = process.wait() => Some(status),
        _ = &mut stop => None,
    };
    let result = match exited {
        Some(status) => status,
        None => process.terminate(grace).await,
    };

    match result {
        Ok(status) => {
            info!(tag = %tag, status = ?status, "Core process exited");
            let exit = UnitExit::Exited(status);
            for hook in &hooks {
                hook.on_close(&tag, &exit);
            }
        }
        Err(source) => {
            let err = SupervisorError::Wait {
                tag: tag.clone(),
                source,
            };
            error!(tag = %tag, error = %err, "Lost track of core process");
            for hook in &hooks {
                hook.on_error(&tag, &err);
            }
        }
    }
}

/// Builder for [`Cluster`].
pub struct ClusterBuilder {
    tag_name: String,
    routes: Vec<Route>,
    values: HashMap<String, Value>,
    cores: Vec<CoreDefinition>,
    hooks: Arc<dyn SupervisorHooks>,
    context: SupervisorContext,
    config: SupervisorConfig,
}

impl ClusterBuilder {
    pub fn tag_name(mut self, tag_name: impl Into<String>) -> Self {
        self.tag_name = tag_name.into();
        self
    }

    /// Route served by the master process itself.
    pub fn route(mut self, route: Route) -> Self {
        self.routes.push(route);
        self
    }

    /// Seed the master service's scratch store.
    pub fn value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    pub fn core(mut self, core: CoreDefinition) -> Self {
        self.cores.push(core);
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn SupervisorHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// How worker processes are launched.
    pub fn supervisor_config(mut self, config: SupervisorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Cluster {
        let (state, _) = watch::channel(ClusterState::Initializing);
        Cluster {
            tag_name: self.tag_name,
            routes: self.routes,
            values: self.values,
            cores: self.cores,
            hooks: self.hooks,
            context: self.context,
            config: self.config,
            state,
            records: Mutex::new(Vec::new()),
            attached: Mutex::new(None),
            service: Mutex::new(None),
        }
    }
}
