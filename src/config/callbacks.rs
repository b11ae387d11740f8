//! Callback correlation configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::id::DEFAULT_ID_BYTES;
use crate::registry::RegistryConfig;

/// Settings for outstanding request callbacks.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CallbacksConfig {
    /// Default reply timeout in milliseconds. Unset means callbacks wait forever.
    pub timeout_ms: Option<u64>,
    /// Random bytes per generated id (node ids and callback ids).
    pub id_bytes: usize,
}

impl Default for CallbacksConfig {
    fn default() -> Self {
        Self {
            timeout_ms: None,
            id_bytes: DEFAULT_ID_BYTES,
        }
    }
}

impl CallbacksConfig {
    pub fn default_timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Registry settings derived from this section.
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            default_timeout: self.default_timeout(),
            id_bytes: self.id_bytes,
        }
    }
}
