// src/recording/mod.rs
//! Event recording
//!
//! - **Event**: call/return/exception events linked by parent id
//! - **Recorder**: enabled flag plus ordered event log
//! - **Registry**: global recorder and context-scoped recorders
//! - **Suspension**: per-thread guard against recording our own bookkeeping
//! - **Generation**: trace documents built from a recorder
//! - **Exporter**: per-request trace files
//!
//! # Fan-out
//!
//! ```text
//! remote session only      → [global]
//! per-request only         → [context]            (global disabled, no mirror)
//! remote + per-request     → [context] ──mirror──→ global
//! ```

pub mod event;
pub mod exporter;
pub mod generation;
pub mod metadata;
pub mod recorder;
pub mod suspension;

// Re-export commonly used types
pub use event::{ContextKey, Event, EventId, EventKind, EventPayload};
pub use exporter::{Exporter, RequestSummary};
pub use generation::{JsonTraceGenerator, TraceGenerator};
pub use metadata::Metadata;
pub use recorder::{Recorder, RecorderId, RecorderRegistry};
pub use suspension::{is_suspended, suspend, suspended, SuspensionGuard};
