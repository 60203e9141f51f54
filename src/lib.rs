// src/lib.rs
//! ExecMap Engine Library
//!
//! This library records what a web application does while it serves
//! requests: inbound HTTP requests and their responses, and the SQL
//! statements issued while handling them, as call/return events that form
//! an execution trace.
//!
//! # Architecture
//!
//! The engine is structured into several key modules:
//!
//! - **recording**: Events, recorders, suspension and trace generation
//! - **database**: Instrumented connections and execute wrappers
//! - **interception**: Request instrumentation and remote recording control
//! - **observability**: Logging
//! - **utils**: Configuration and errors

// Public module exports
pub mod database;
pub mod interception;
pub mod observability;
pub mod recording;
pub mod utils;

// Re-export commonly used types
pub use database::InstrumentedConnection;
pub use interception::{HttpInterceptor, InterceptorConfig, RemoteControl, RoutingTable};
pub use recording::{Recorder, RecorderRegistry};
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
