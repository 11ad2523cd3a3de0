//! Instance configuration.
//!
//! `ChronosConfig` covers the serializable options and can be loaded from
//! TOML. Injected capabilities (sink, clock, idle scheduler) are supplied
//! through [`ChronosBuilder`](crate::ChronosBuilder).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::scheduler::{DEFAULT_IDLE_TIMEOUT, IdleRequestOptions};
use crate::types::Metadata;

/// Serializable instance options.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ChronosConfig {
    /// Schedule a flush after every successful stop or event measure.
    pub auto_save_on_stop: bool,

    /// Log skipped operations (unmatched stops, unsupported clocks).
    pub debug_mode: bool,

    /// Maximum deferral of an idle request, in milliseconds.
    pub idle_timeout_ms: u64,

    /// Metadata merged into every measure that supplies its own.
    pub global_metadata: Metadata,
}

impl Default for ChronosConfig {
    fn default() -> Self {
        Self {
            auto_save_on_stop: true,
            debug_mode: false,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT.as_millis() as u64,
            global_metadata: Metadata::new(),
        }
    }
}

impl ChronosConfig {
    /// Parse configuration from a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn with_auto_save(mut self, enabled: bool) -> Self {
        self.auto_save_on_stop = enabled;
        self
    }

    pub fn with_debug_mode(mut self, enabled: bool) -> Self {
        self.debug_mode = enabled;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_global_metadata(mut self, metadata: Metadata) -> Self {
        self.global_metadata = metadata;
        self
    }

    /// Options attached to every idle request.
    pub fn idle_options(&self) -> IdleRequestOptions {
        IdleRequestOptions {
            timeout: Duration::from_millis(self.idle_timeout_ms),
        }
    }
}
