// src/database/wrapper.rs
//! Statement execution wrappers
//!
//! Wrappers form a chain around every statement a connection runs, outermost
//! first. [`StatementRecorder`] is the wrapper that turns executions into
//! `sql_query` call events followed by return events.

use crate::database::version::DatabaseVersion;
use crate::recording::event::{ContextKey, Event, SqlQuery};
use crate::recording::metadata::Metadata;
use crate::recording::recorder::RecorderRegistry;
use crate::recording::suspension;
use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Backend identity, resolved once when the connection is created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub vendor: String,
    pub version: Option<DatabaseVersion>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementKind {
    /// One execution; `expanded` is the statement with parameters
    /// substituted by the driver, when it could produce one
    Single { expanded: Option<String> },

    /// One statement run once per parameter set; `count` is `None` when the
    /// number of sets is not known up front
    Batch { count: Option<usize> },
}

/// Everything a wrapper may inspect about an execution
#[derive(Debug)]
pub struct ExecuteContext<'a> {
    pub sql: &'a str,
    pub kind: StatementKind,
    pub connection: &'a ConnectionInfo,

    /// Set by the innermost link of the chain once the statement has run
    execution_time: Cell<Option<Duration>>,
}

impl<'a> ExecuteContext<'a> {
    pub fn new(sql: &'a str, kind: StatementKind, connection: &'a ConnectionInfo) -> Self {
        Self {
            sql,
            kind,
            connection,
            execution_time: Cell::new(None),
        }
    }

    /// Statement text as it appears in the trace
    pub fn statement_text(&self) -> String {
        match &self.kind {
            StatementKind::Single { expanded } => {
                expanded.clone().unwrap_or_else(|| self.sql.to_string())
            }
            StatementKind::Batch { count: Some(count) } => format!("{} times {}", count, self.sql),
            StatementKind::Batch { count: None } => format!("? times {}", self.sql),
        }
    }

    /// Time spent in the statement itself, excluding every wrapper
    ///
    /// `None` until the chain has reached the statement and it returned.
    pub fn execution_time(&self) -> Option<Duration> {
        self.execution_time.get()
    }
}

/// Hook around statement execution
pub trait ExecuteWrapper: Any + Send + Sync {
    /// Run `execute` exactly once, doing any work around it
    fn call(&self, ctx: &ExecuteContext<'_>, execute: &mut dyn FnMut());

    fn as_any(&self) -> &dyn Any;
}

/// Invoke `execute` through `wrappers`, first wrapper outermost
pub(crate) fn run_chain(
    wrappers: &[Arc<dyn ExecuteWrapper>],
    ctx: &ExecuteContext<'_>,
    execute: &mut dyn FnMut(),
) {
    match wrappers.split_first() {
        None => {
            let start = Instant::now();
            execute();
            ctx.execution_time.set(Some(start.elapsed()));
        }
        Some((outer, rest)) => outer.call(ctx, &mut || run_chain(rest, ctx, &mut *execute)),
    }
}

/// Driver name registered in trace metadata whenever a statement is captured
pub const DRIVER_NAME: &str = "rusqlite";
pub const DRIVER_VERSION: &str = "0.30";

/// Records executed statements into the current recorder
pub struct StatementRecorder {
    registry: Arc<RecorderRegistry>,
    metadata: Arc<Metadata>,
}

impl StatementRecorder {
    pub fn new(registry: Arc<RecorderRegistry>, metadata: Arc<Metadata>) -> Self {
        Self { registry, metadata }
    }

    fn record(&self, ctx: &ExecuteContext<'_>, elapsed: Duration) {
        if suspension::is_suspended() {
            // The engine itself issued this statement
            return;
        }

        let recorder = self.registry.current(ContextKey::current());
        if !recorder.is_enabled() {
            return;
        }
        self.metadata.add_framework(DRIVER_NAME, DRIVER_VERSION);

        let call = Event::sql_call(SqlQuery {
            sql: ctx.statement_text(),
            database_type: ctx.connection.vendor.clone(),
            server_version: ctx.connection.version.clone(),
        });
        let call_id = call.id;
        debug!(event = %call_id, recorder = %recorder.id(), "Recording statement");

        if let Err(e) = recorder.add_event(call) {
            warn!("Dropping statement event: {}", e);
            return;
        }
        if let Err(e) = recorder.add_event(Event::returned(call_id, elapsed)) {
            warn!("Dropping statement return event: {}", e);
        }
    }
}

impl ExecuteWrapper for StatementRecorder {
    fn call(&self, ctx: &ExecuteContext<'_>, execute: &mut dyn FnMut()) {
        let start = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| execute()));
        let elapsed = ctx.execution_time().unwrap_or_else(|| start.elapsed());

        // Recorded even when the statement unwinds
        self.record(ctx, elapsed);

        if let Err(payload) = outcome {
            panic::resume_unwind(payload);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
