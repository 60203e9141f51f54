// src/recording/generation.rs
//! Trace generation
//!
//! Turns a recorder's event log into a structured trace document.

use crate::recording::metadata::Metadata;
use crate::recording::recorder::Recorder;
use crate::utils::errors::Result;
use serde_json::{json, Value};
use std::sync::Arc;

/// Trace document version emitted by [`JsonTraceGenerator`]
pub const TRACE_VERSION: &str = "1.9";

/// Serializes a recorder into a trace document
pub trait TraceGenerator: Send + Sync {
    fn dump(&self, recorder: &Recorder) -> Result<Value>;
}

/// Default JSON trace generator
pub struct JsonTraceGenerator {
    metadata: Arc<Metadata>,
}

impl JsonTraceGenerator {
    pub fn new(metadata: Arc<Metadata>) -> Self {
        Self { metadata }
    }
}

impl TraceGenerator for JsonTraceGenerator {
    fn dump(&self, recorder: &Recorder) -> Result<Value> {
        let events: Vec<Value> = recorder.events().iter().map(|e| e.to_json()).collect();

        Ok(json!({
            "version": TRACE_VERSION,
            "metadata": {
                "language": { "name": "rust" },
                "client": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "recorder": { "name": recorder.id().to_string() },
                "frameworks": self.metadata.frameworks(),
            },
            "classMap": [],
            "events": events,
        }))
    }
}
