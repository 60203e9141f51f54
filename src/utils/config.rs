// src/utils/config.rs
//! Engine configuration
//!
//! Layered from built-in defaults, an optional `execmap.toml` in the working
//! directory and `EXECMAP_*` environment variables (nested keys separated by
//! `__`, e.g. `EXECMAP_RECORDING__RECORD_ALL_REQUESTS=true`).

use crate::utils::errors::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default path of the remote recording control surface
pub const DEFAULT_CONTROL_PATH: &str = "/_appmap/record";

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub recording: RecordingConfig,
    pub server: ServerConfig,
}

/// Recording behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Master switch; when off every request passes through untouched
    pub enabled: bool,

    /// Record every request into its own context-scoped trace
    pub record_all_requests: bool,

    /// Where per-request traces are written
    pub output_dir: PathBuf,

    /// Reserved request path of the remote control surface
    pub control_path: String,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            record_all_requests: false,
            output_dir: PathBuf::from("tmp/appmap"),
            control_path: DEFAULT_CONTROL_PATH.to_string(),
        }
    }
}

/// Demo server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    /// SQLite database file; `:memory:` keeps everything in process
    pub database: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            database: ":memory:".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        let defaults = Config::try_from(&EngineConfig::default())?;

        let config = Config::builder()
            .add_source(defaults)
            .add_source(File::with_name("execmap").required(false))
            .add_source(
                Environment::with_prefix("EXECMAP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
