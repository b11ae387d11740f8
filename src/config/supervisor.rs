//! Supervisor (process tree) configuration.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

/// Default grace period between SIGTERM and SIGKILL.
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2000;

/// How the master process launches its core workers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Program to execute per core. Defaults to the current executable.
    pub program: Option<String>,
    /// Arguments for `program`. Defaults to the current process arguments
    /// when `program` is unset.
    pub args: Vec<String>,
    /// Extra environment variables for every worker.
    pub env: HashMap<String, String>,
    /// Grace period before a worker that ignored SIGTERM is killed.
    pub shutdown_grace_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            env: HashMap::new(),
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
        }
    }
}

impl SupervisorConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
