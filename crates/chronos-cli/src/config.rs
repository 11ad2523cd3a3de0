//! Configuration file support for the chronos CLI.
//!
//! CLI data lives in a `.chronos/` directory:
//! - `.chronos/config.toml` - Configuration file
//! - `.chronos/logs/` - Log files (when file logging is enabled)
//!
//! Config discovery searches for `.chronos/config.toml` starting from the current
//! directory and walking up to parent directories.

use std::path::{Path, PathBuf};

/// The chronos data directory name.
pub const CHRONOS_DIR: &str = ".chronos";
/// The config file name within the chronos directory.
pub const CONFIG_FILE: &str = "config.toml";

use anyhow::{Context, Result};
use chronos::ChronosConfig;
use chronos::types::RESERVED_KEYS;
use serde::{Deserialize, Serialize};

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Measure instance settings.
    pub chronos: ChronosConfig,
    /// Where delivered records go.
    pub output: OutputConfig,
    /// Log destination settings.
    pub logging: LoggingConfig,
}

/// Record output configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct OutputConfig {
    /// JSON-lines file records are appended to. Stdout when unset.
    pub path: Option<PathBuf>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Write logs to daily-rotated files instead of stderr.
    pub to_file: bool,
    /// Log directory, relative to `.chronos/`.
    pub dir: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            to_file: false,
            dir: PathBuf::from("logs"),
        }
    }
}

impl Config {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Find and load configuration from current or parent directories.
    pub fn find_and_load() -> Result<Option<(Self, PathBuf)>> {
        let current = std::env::current_dir()?;
        Self::find_and_load_from(&current)
    }

    /// Find and load configuration starting from a specific directory.
    ///
    /// Looks for `.chronos/config.toml` in the directory and its parents.
    /// Returns the `.chronos` directory alongside the config.
    pub fn find_and_load_from(start: &Path) -> Result<Option<(Self, PathBuf)>> {
        let mut dir = start.to_path_buf();

        loop {
            let chronos_dir = dir.join(CHRONOS_DIR);
            let config_path = chronos_dir.join(CONFIG_FILE);
            if config_path.exists() {
                let config = Self::from_file(&config_path)?;
                return Ok(Some((config, chronos_dir)));
            }

            if !dir.pop() {
                break;
            }
        }

        Ok(None)
    }

    /// Resolve a path relative to the .chronos directory.
    fn resolve(path: &Path, chronos_dir: Option<&Path>) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else if let Some(dir) = chronos_dir {
            dir.join(path)
        } else {
            PathBuf::from(CHRONOS_DIR).join(path)
        }
    }

    /// Resolve the record output file, if one is configured.
    pub fn resolve_output_path(&self, chronos_dir: Option<&Path>) -> Option<PathBuf> {
        self.output
            .path
            .as_deref()
            .map(|path| Self::resolve(path, chronos_dir))
    }

    /// Resolve the log directory.
    pub fn resolve_log_dir(&self, chronos_dir: Option<&Path>) -> PathBuf {
        Self::resolve(&self.logging.dir, chronos_dir)
    }
}

/// Configuration validation error.
#[derive(Debug, Clone)]
pub struct ConfigValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ConfigValidationError {}

impl Config {
    /// Validate the configuration.
    ///
    /// Returns a list of validation errors if any are found.
    pub fn validate(&self) -> Vec<ConfigValidationError> {
        let mut errors = Vec::new();

        if self.chronos.idle_timeout_ms == 0 {
            errors.push(ConfigValidationError {
                field: "chronos.idle_timeout_ms".to_string(),
                message: "Idle timeout must be greater than zero.".to_string(),
            });
        }

        // Reserved keys would be dropped from every record
        for key in self.chronos.global_metadata.keys() {
            if RESERVED_KEYS.contains(&key.as_str()) {
                errors.push(ConfigValidationError {
                    field: format!("chronos.global_metadata.{}", key),
                    message: format!("'{}' is a record field and cannot be used as metadata.", key),
                });
            }
        }

        if self.output.path.as_deref() == Some(Path::new("")) {
            errors.push(ConfigValidationError {
                field: "output.path".to_string(),
                message: "Output path cannot be empty. Remove it to write to stdout.".to_string(),
            });
        }

        errors
    }
}

/// Contents written by `chronos init`.
pub const DEFAULT_CONFIG: &str = r#"# chronos configuration
# All paths are relative to this .chronos/ directory unless absolute

[chronos]
auto_save_on_stop = true
debug_mode = false
idle_timeout_ms = 2000

# Merged into every measure that carries its own metadata
[chronos.global_metadata]
tags = []

[output]
# path = "measures.jsonl"  # Append records here instead of stdout

[logging]
to_file = false
dir = "logs"
"#;
