// src/observability/mod.rs
//! Logging setup
//!
//! The filter comes from `RUST_LOG` (default `info`). Set
//! `EXECMAP_LOG_FORMAT=json` for structured output.

use crate::utils::errors::{EngineError, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global tracing subscriber
pub fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("EXECMAP_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = fmt().with_env_filter(filter).with_target(true);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| EngineError::ConfigError(format!("Failed to install subscriber: {}", e)))
}
