//! Process-wide callback registry.
//!
//! Correlates replies with the continuation of the request that caused them.
//! One registry is shared (by `Arc`) between every node in a process, since a
//! reply arrives on the originating node's channel but any node may have
//! registered the continuation.
//!
//! Entries are removed when they are resolved, expire, are cancelled or are
//! discarded, so a continuation runs at most once.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::envelope::Params;
use crate::id::{gen_id, DEFAULT_ID_BYTES};

/// Why a continuation ran without a reply.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallbackError {
    #[error("No reply for callback {callback_id} within {timeout:?}")]
    Timeout {
        callback_id: String,
        timeout: Duration,
    },

    #[error("Callback {0} cancelled")]
    Cancelled(String),
}

/// Code to run when the reply (or its failure) arrives.
pub type Continuation = Box<dyn FnOnce(Result<Params, CallbackError>) + Send + 'static>;

/// Registry settings.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Timeout applied when the caller gives none. `None` waits forever.
    pub default_timeout: Option<Duration>,
    /// Random bytes per callback id.
    pub id_bytes: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_timeout: None,
            id_bytes: DEFAULT_ID_BYTES,
        }
    }
}

struct Pending {
    continuation: Continuation,
    timeout: Option<Duration>,
    timer: Option<JoinHandle<()>>,
}

impl Pending {
    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Concurrent map of outstanding callbacks.
pub struct CallbackRegistry {
    entries: Mutex<HashMap<String, Pending>>,
    config: RegistryConfig,
    /// Runtime the timeout timers run on.
    timers: Option<Handle>,
}

impl CallbackRegistry {
    /// Create a registry.
    ///
    /// Timeout timers run on the runtime this is called from, not on the
    /// runtime of whoever registers, so a worker thread shutting down its
    /// own runtime cannot strand an entry. Outside a runtime, timers fall
    /// back to the registering task's runtime.
    pub fn new(config: RegistryConfig) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            config,
            timers: Handle::try_current().ok(),
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Store a continuation under a fresh id and return the id.
    ///
    /// `timeout` overrides the registry default. When a timeout applies, a
    /// timer task expires the entry unless it is resolved first.
    pub async fn register(
        self: &Arc<Self>,
        continuation: Continuation,
        timeout: Option<Duration>,
    ) -> String {
        let timeout = timeout.or(self.config.default_timeout);
        let mut entries = self.entries.lock().await;

        let mut callback_id = gen_id(self.config.id_bytes);
        while entries.contains_key(&callback_id) {
            callback_id = gen_id(self.config.id_bytes);
        }

        let timer = timeout.map(|after| {
            let registry: Weak<Self> = Arc::downgrade(self);
            let id = callback_id.clone();
            let timer = async move {
                tokio::time::sleep(after).await;
                if let Some(registry) = registry.upgrade() {
                    registry.expire(&id).await;
                }
            };
            match &self.timers {
                Some(handle) => handle.spawn(timer),
                None => tokio::spawn(timer),
            }
        });

        entries.insert(
            callback_id.clone(),
            Pending {
                continuation,
                timeout,
                timer,
            },
        );

        debug!(callback_id = %callback_id, timeout = ?timeout, "Callback registered");
        callback_id
    }

    /// Deliver reply params. Returns `false` if the id is unknown.
    ///
    /// The entry is removed before the continuation runs, so a duplicate or
    /// late reply finds nothing.
    pub async fn resolve(&self, callback_id: &str, params: Params) -> bool {
        let Some(pending) = self.take(callback_id).await else {
            debug!(callback_id = %callback_id, "Reply for unknown callback ignored");
            return false;
        };

        debug!(callback_id = %callback_id, "Callback resolved");
        (pending.continuation)(Ok(params));
        true
    }

    /// Fail an outstanding callback with a timeout error.
    pub async fn expire(&self, callback_id: &str) -> bool {
        let Some(pending) = self.take(callback_id).await else {
            return false;
        };

        let timeout = pending.timeout.unwrap_or_default();
        warn!(callback_id = %callback_id, timeout = ?timeout, "Callback timed out");
        (pending.continuation)(Err(CallbackError::Timeout {
            callback_id: callback_id.to_string(),
            timeout,
        }));
        true
    }

    /// Fail an outstanding callback with a cancellation error.
    pub async fn cancel(&self, callback_id: &str) -> bool {
        let Some(pending) = self.take(callback_id).await else {
            return false;
        };

        debug!(callback_id = %callback_id, "Callback cancelled");
        (pending.continuation)(Err(CallbackError::Cancelled(callback_id.to_string())));
        true
    }

    /// Remove an entry without running its continuation.
    ///
    /// Used when the request carrying the id was never published.
    pub async fn discard(&self, callback_id: &str) -> bool {
        self.take(callback_id).await.is_some()
    }

    pub async fn contains(&self, callback_id: &str) -> bool {
        self.entries.lock().await.contains_key(callback_id)
    }

    pub async fn pending_count(&self) -> usize {
        self.entries.lock().await.len()
    }

    async fn take(&self, callback_id: &str) -> Option<Pending> {
        let mut pending = self.entries.lock().await.remove(callback_id)?;
        pending.disarm();
        Some(pending)
    }
}

impl Drop for CallbackRegistry {
    fn drop(&mut self) {
        for pending in self.entries.get_mut().values_mut() {
            pending.disarm();
        }
    }
}
