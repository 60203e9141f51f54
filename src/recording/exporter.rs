// src/recording/exporter.rs
//! Per-request trace files
//!
//! When every request is recorded on its own, the finished trace of each
//! request is written to `<output_dir>/requests/` as soon as it completes.

use crate::recording::generation::TraceGenerator;
use crate::recording::recorder::Recorder;
use crate::utils::errors::{EngineError, Result};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Identifies the request a trace belongs to
#[derive(Debug, Clone)]
pub struct RequestSummary {
    pub method: String,
    pub path_info: String,

    /// Path including the query string
    pub full_path: String,

    pub status_code: u16,
}

/// Writes per-request traces to disk
pub struct Exporter {
    generator: Arc<dyn TraceGenerator>,
    output_dir: PathBuf,
}

impl Exporter {
    pub fn new(generator: Arc<dyn TraceGenerator>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            generator,
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Write the trace of one request, returning the file path
    pub fn write_request_trace(&self, request: &RequestSummary, recorder: &Recorder) -> Result<PathBuf> {
        let mut trace = self.generator.dump(recorder)?;

        let name = format!(
            "{} {} ({})",
            request.method, request.full_path, request.status_code
        );
        if let Some(metadata) = trace.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            metadata.insert("name".to_string(), json!(name));
            metadata.insert(
                "timestamp".to_string(),
                json!(chrono::Utc::now().to_rfc3339()),
            );
        }

        let dir = self.output_dir.join("requests");
        fs::create_dir_all(&dir).map_err(|e| {
            EngineError::ExportFailed(format!("Failed to create {}: {}", dir.display(), e))
        })?;

        let file_name = format!(
            "{}_{}_{}.appmap.json",
            chrono::Utc::now().timestamp_millis(),
            request.method,
            sanitize(&request.path_info)
        );
        let path = dir.join(file_name);

        let body = serde_json::to_vec(&trace)?;
        fs::write(&path, body).map_err(|e| {
            EngineError::ExportFailed(format!("Failed to write {}: {}", path.display(), e))
        })?;

        debug!("Wrote request trace {}", path.display());
        Ok(path)
    }
}

/// Make a request path usable as part of a file name
fn sanitize(path: &str) -> String {
    let cleaned: String = path
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    let trimmed = cleaned.trim_matches('_');
    if trimmed.is_empty() {
        "root".to_string()
    } else {
        trimmed.to_string()
    }
}
