// src/database/connection.rs
//! Instrumented SQLite connection
//!
//! Creating an [`InstrumentedConnection`] is the connection-created hook: the
//! backend version is resolved right away (so capturing a statement never
//! needs a side query) and a [`StatementRecorder`] is attached unless one is
//! already installed. Every statement then runs through the wrapper chain.

use crate::database::version::{database_version, RawVersion};
use crate::database::wrapper::{
    run_chain, ConnectionInfo, ExecuteContext, ExecuteWrapper, StatementKind, StatementRecorder,
};
use crate::recording::metadata::Metadata;
use crate::recording::recorder::RecorderRegistry;
use rusqlite::{Connection, Params, Result, Row, Statement, ToSql};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

pub const SQLITE_VENDOR: &str = "sqlite";

/// A `rusqlite` connection whose statements pass through execute wrappers
pub struct InstrumentedConnection {
    conn: Connection,
    info: ConnectionInfo,
    wrappers: Vec<Arc<dyn ExecuteWrapper>>,
}

impl InstrumentedConnection {
    pub fn new(conn: Connection, registry: Arc<RecorderRegistry>, metadata: Arc<Metadata>) -> Self {
        let info = ConnectionInfo {
            vendor: SQLITE_VENDOR.to_string(),
            version: database_version(
                SQLITE_VENDOR,
                Some(RawVersion::Number(rusqlite::version_number() as u32)),
            ),
        };
        debug!("Connection created: {} {:?}", info.vendor, info.version);

        let mut connection = Self {
            conn,
            info,
            wrappers: Vec::new(),
        };
        connection.install_wrapper(StatementRecorder::new(registry, metadata));
        connection
    }

    pub fn open(
        path: impl AsRef<Path>,
        registry: Arc<RecorderRegistry>,
        metadata: Arc<Metadata>,
    ) -> Result<Self> {
        Ok(Self::new(Connection::open(path)?, registry, metadata))
    }

    pub fn open_in_memory(registry: Arc<RecorderRegistry>, metadata: Arc<Metadata>) -> Result<Self> {
        Ok(Self::new(Connection::open_in_memory()?, registry, metadata))
    }

    /// Attach `wrapper` unless a wrapper of the same type is present
    ///
    /// Returns whether it was attached.
    pub fn install_wrapper<W: ExecuteWrapper>(&mut self, wrapper: W) -> bool {
        if self.has_wrapper::<W>() {
            return false;
        }
        self.wrappers.push(Arc::new(wrapper));
        true
    }

    pub fn has_wrapper<W: ExecuteWrapper>(&self) -> bool {
        self.wrappers.iter().any(|w| w.as_any().is::<W>())
    }

    pub fn wrapper_count(&self) -> usize {
        self.wrappers.len()
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Execute one statement with positional parameters
    pub fn execute(&self, sql: &str, params: &[&dyn ToSql]) -> Result<usize> {
        match self.prepare_bound(sql, params) {
            Ok(mut stmt) => {
                let expanded = stmt.expanded_sql();
                self.run(sql, StatementKind::Single { expanded }, || stmt.raw_execute())
            }
            Err(e) => self.run(sql, StatementKind::Single { expanded: None }, || Err(e)),
        }
    }

    /// Execute one statement once per parameter set
    ///
    /// Recorded as a single `"<count> times <sql>"` statement; the count is
    /// `?` when the iterator cannot tell its exact length.
    pub fn execute_many<I, P>(&self, sql: &str, param_sets: I) -> Result<usize>
    where
        I: IntoIterator<Item = P>,
        P: Params,
    {
        let sets = param_sets.into_iter();
        let count = match sets.size_hint() {
            (lower, Some(upper)) if lower == upper => Some(lower),
            _ => None,
        };
        let kind = StatementKind::Batch { count };

        match self.conn.prepare(sql) {
            Ok(mut stmt) => self.run(sql, kind, || {
                let mut changed = 0;
                for params in sets {
                    changed += stmt.execute(params)?;
                }
                Ok(changed)
            }),
            Err(e) => self.run(sql, kind, || Err(e)),
        }
    }

    /// Run a query and map every row
    pub fn query_rows<T, F>(&self, sql: &str, params: &[&dyn ToSql], mut f: F) -> Result<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> Result<T>,
    {
        match self.prepare_bound(sql, params) {
            Ok(mut stmt) => {
                let expanded = stmt.expanded_sql();
                self.run(sql, StatementKind::Single { expanded }, || {
                    let mut rows = stmt.raw_query();
                    let mut mapped = Vec::new();
                    while let Some(row) = rows.next()? {
                        mapped.push(f(row)?);
                    }
                    Ok(mapped)
                })
            }
            Err(e) => self.run(sql, StatementKind::Single { expanded: None }, || Err(e)),
        }
    }

    /// Execute a script of several statements without parameters
    pub fn execute_script(&self, sql: &str) -> Result<()> {
        self.run(sql, StatementKind::Single { expanded: None }, || {
            self.conn.execute_batch(sql)
        })
    }

    fn prepare_bound(&self, sql: &str, params: &[&dyn ToSql]) -> Result<Statement<'_>> {
        let mut stmt = self.conn.prepare(sql)?;
        let expected = stmt.parameter_count();
        if params.len() != expected {
            return Err(rusqlite::Error::InvalidParameterCount(params.len(), expected));
        }
        for (index, param) in params.iter().enumerate() {
            stmt.raw_bind_parameter(index + 1, *param)?;
        }
        Ok(stmt)
    }

    /// Run `execute` through the wrapper chain and hand back its own result
    fn run<T>(&self, sql: &str, kind: StatementKind, execute: impl FnOnce() -> Result<T>) -> Result<T> {
        let ctx = ExecuteContext::new(sql, kind, &self.info);

        let mut pending = Some(execute);
        let mut outcome = None;
        run_chain(&self.wrappers, &ctx, &mut || {
            if let Some(execute) = pending.take() {
                outcome = Some(execute());
            }
        });

        if let Some(result) = outcome {
            return result;
        }

        // A wrapper skipped execution; the statement still has to run
        warn!("Execute wrapper did not run statement, executing directly");
        match pending.take() {
            Some(execute) => execute(),
            None => unreachable!("statement consumed without producing a result"),
        }
    }
}
