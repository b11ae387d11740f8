//! Supervisor tree: Cluster → Core → Thread.
//!
//! A [`Cluster`] started in the master role re-executes the current program
//! once per [`CoreDefinition`], passing the core's tag in
//! [`CORE_TAG_ENV_VAR`]. Each worker process starts the same cluster, sees
//! the tag, and attaches only its own [`Core`]. The master serves the
//! cluster's own routes, so a cluster without cores is a complete
//! single-process deployment. A core may spawn threads,
//! each with its own runtime, bus handle and a copy of the core's scratch
//! store.
//!
//! Hooks are observational. Nothing is restarted automatically.

mod cluster;
mod core;
mod process;
mod thread;

pub use self::core::{Core, CoreDefinition, CoreState};
pub use cluster::{Cluster, ClusterBuilder, ClusterState};
pub use process::WorkerCommand;
pub use thread::{
    attach_to_parent_snapshot, spawn_thread, ThreadContext, ThreadDefinition, ThreadHandle,
    ThreadMain,
};

use std::process::ExitStatus;
use std::sync::Arc;

use crate::bus::Bus;
use crate::node::NodeError;
use crate::registry::CallbackRegistry;

/// Environment variable carrying a worker's core tag.
pub const CORE_TAG_ENV_VAR: &str = "SWITCHBOARD_CORE_TAG";

/// Errors raised by the supervisor tree.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Failed to spawn core '{tag}': {source}")]
    Spawn {
        tag: String,
        source: std::io::Error,
    },

    #[error("No core definition with tag '{0}'")]
    UnknownCore(String),

    #[error("SWITCHBOARD_CORE_TAG is not set")]
    NoCoreTag,

    #[error("Failed to start thread '{tag}': {source}")]
    ThreadSpawn {
        tag: String,
        source: std::io::Error,
    },

    #[error("Thread '{tag}' failed: {message}")]
    ThreadFailed { tag: String, message: String },

    #[error("Failed to wait for core '{tag}': {source}")]
    Wait {
        tag: String,
        source: std::io::Error,
    },

    #[error("Cluster already started")]
    AlreadyStarted,

    #[error(transparent)]
    Node(#[from] NodeError),
}

/// How a supervised unit ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitExit {
    /// A core process exited.
    Exited(ExitStatus),
    /// A core or thread finished normally.
    Returned,
    /// A thread panicked.
    Panicked(String),
}

impl UnitExit {
    pub fn success(&self) -> bool {
        match self {
            UnitExit::Exited(status) => status.success(),
            UnitExit::Returned => true,
            UnitExit::Panicked(_) => false,
        }
    }
}

/// Lifecycle hooks for clusters, cores and threads. All default to no-ops.
///
/// `tag` names the unit the event is about, so one hooks object can observe
/// a unit and its children.
pub trait SupervisorHooks: Send + Sync {
    fn on_ready(&self, _tag: &str) {}

    fn on_close(&self, _tag: &str, _exit: &UnitExit) {}

    fn on_error(&self, _tag: &str, _error: &SupervisorError) {}
}

/// Hooks that ignore every event.
pub struct NoopHooks;

impl SupervisorHooks for NoopHooks {}

/// Shared collaborators every unit in a process builds its services on.
#[derive(Clone)]
pub struct SupervisorContext {
    pub bus: Arc<dyn Bus>,
    pub registry: Arc<CallbackRegistry>,
}

impl SupervisorContext {
    pub fn new(bus: Arc<dyn Bus>, registry: Arc<CallbackRegistry>) -> Self {
        Self { bus, registry }
    }
}

/// Which side of the process tree this process is on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Master,
    Worker(String),
}

impl Role {
    /// Worker if [`CORE_TAG_ENV_VAR`] holds a non-blank tag, master otherwise.
    pub fn detect() -> Self {
        match Self::worker_tag() {
            Ok(tag) => Role::Worker(tag),
            Err(_) => Role::Master,
        }
    }

    /// The tag assigned to this worker process.
    pub fn worker_tag() -> Result<String, SupervisorError> {
        match std::env::var(CORE_TAG_ENV_VAR) {
            Ok(tag) if !tag.trim().is_empty() => Ok(tag),
            _ => Err(SupervisorError::NoCoreTag),
        }
    }

    pub fn is_master(&self) -> bool {
        matches!(self, Role::Master)
    }
}
