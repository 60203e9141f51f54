// src/database/mod.rs
//! Statement instrumentation
//!
//! Every statement issued through an [`InstrumentedConnection`] passes
//! through its execute wrappers, outermost first. The built-in
//! [`StatementRecorder`] emits an `sql_query` call and a return event
//! around the statement unless recording is suspended or off.

pub mod connection;
pub mod version;
pub mod wrapper;

// Re-export commonly used types
pub use connection::{InstrumentedConnection, SQLITE_VENDOR};
pub use version::{database_version, DatabaseVersion, RawVersion};
pub use wrapper::{ConnectionInfo, ExecuteContext, ExecuteWrapper, StatementKind, StatementRecorder};
