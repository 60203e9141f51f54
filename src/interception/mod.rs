// src/interception/mod.rs
//! Request interception layer
//!
//! This module wraps the application's request handling:
//!
//! - **HTTP Interceptor**: request/response events around the handler
//! - **Routing Table**: path templates and regex routes
//! - **Path Normalizer**: `/articles/42` → `/articles/{id}`
//! - **Params**: query, form and JSON body parameters
//! - **Remote Control**: start/stop recording over HTTP
//!
//! # Architecture
//!
//! ```text
//! Incoming Request
//!     │
//!     ├─ control path → Remote Control → global recorder
//!     └─ anything else → HTTP Interceptor
//!                            ├─ call event (params, normalized path)
//!                            ├─ application handler (SQL events nest here)
//!                            └─ response or exception event
//! ```

pub mod http_interceptor;
pub mod params;
pub mod path_normalizer;
pub mod remote_control;
pub mod routing_table;

// Re-export commonly used types
pub use http_interceptor::{HttpInterceptor, InterceptorConfig};
pub use path_normalizer::normalize_path;
pub use remote_control::{ControlError, RemoteControl};
pub use routing_table::{ResolvedRoute, Resolver, Route, RoutingTable};
