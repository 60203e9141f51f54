// src/recording/recorder.rs
//! Event recorders
//!
//! A [`Recorder`] is an enabled flag plus an append-only event log. The
//! [`RecorderRegistry`] owns the process-wide global recorder and the
//! context-scoped recorders keyed by [`ContextKey`]; it is built once at
//! startup and shared by reference with every instrumentation site.
//!
//! A context recorder mirrors each accepted event into the global recorder
//! while the global one is enabled. Fan-out must therefore target either the
//! global recorder or a context recorder for a given occurrence, never both.

use crate::recording::event::{ContextKey, Event, EventId};
use crate::utils::errors::{EngineError, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Which recorder this is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecorderId {
    Global,
    Context(ContextKey),
}

impl fmt::Display for RecorderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecorderId::Global => write!(f, "global"),
            RecorderId::Context(key) => write!(f, "context-{}", key),
        }
    }
}

#[derive(Default)]
struct EventLog {
    events: Vec<Event>,
    /// Ids of the call events present in `events`
    calls: HashSet<EventId>,
    rejected: u64,
}

/// Recorder statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecorderStats {
    pub events_recorded: usize,
    pub events_rejected: u64,
}

/// Event log with start/stop/clear lifecycle
pub struct Recorder {
    id: RecorderId,
    enabled: AtomicBool,
    log: Mutex<EventLog>,
    mirror: Option<Arc<Recorder>>,
}

impl Recorder {
    /// Create the process-wide recorder
    pub fn global() -> Self {
        Self {
            id: RecorderId::Global,
            enabled: AtomicBool::new(false),
            log: Mutex::new(EventLog::default()),
            mirror: None,
        }
    }

    /// Create a recorder for one execution context, mirroring into `global`
    pub fn scoped(key: ContextKey, global: Arc<Recorder>) -> Self {
        Self {
            id: RecorderId::Context(key),
            enabled: AtomicBool::new(false),
            log: Mutex::new(EventLog::default()),
            mirror: Some(global),
        }
    }

    pub fn id(&self) -> RecorderId {
        self.id
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Enable recording. Idempotent.
    pub fn start(&self) {
        if !self.enabled.swap(true, Ordering::AcqRel) {
            debug!(recorder = %self.id, "Recording started");
        }
    }

    /// Disable recording and return a snapshot of the log. Idempotent.
    pub fn stop(&self) -> Vec<Event> {
        if self.enabled.swap(false, Ordering::AcqRel) {
            debug!(recorder = %self.id, "Recording stopped");
        }
        self.events()
    }

    /// Drop all recorded events; only valid while stopped
    pub fn clear(&self) -> Result<()> {
        if self.is_enabled() {
            return Err(EngineError::RecorderActive(self.id.to_string()));
        }
        let mut log = self.log.lock();
        log.events.clear();
        log.calls.clear();
        Ok(())
    }

    /// Append an event
    ///
    /// Return and exception events must reference a call already in this
    /// log; otherwise the event is rejected and the log is left unchanged.
    pub fn add_event(&self, event: Event) -> Result<()> {
        let mirrored = match &self.mirror {
            Some(global) if global.is_enabled() => Some((Arc::clone(global), event.clone())),
            _ => None,
        };

        self.append(event)?;

        if let Some((global, event)) = mirrored {
            if let Err(e) = global.append(event) {
                // The global recorder was started after the call was emitted
                debug!("Not mirroring into global recorder: {}", e);
            }
        }

        Ok(())
    }

    fn append(&self, event: Event) -> Result<()> {
        let mut log = self.log.lock();

        if let Some(parent) = event.parent_id {
            if !log.calls.contains(&parent) {
                log.rejected += 1;
                return Err(EngineError::DanglingParent {
                    event: event.id,
                    parent,
                });
            }
        }

        if event.is_call() {
            log.calls.insert(event.id);
        }
        log.events.push(event);
        Ok(())
    }

    /// Snapshot of the log in insertion order
    pub fn events(&self) -> Vec<Event> {
        self.log.lock().events.clone()
    }

    pub fn len(&self) -> usize {
        self.log.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> RecorderStats {
        let log = self.log.lock();
        RecorderStats {
            events_recorded: log.events.len(),
            events_rejected: log.rejected,
        }
    }
}

impl fmt::Debug for Recorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recorder")
            .field("id", &self.id)
            .field("enabled", &self.is_enabled())
            .field("events", &self.len())
            .finish()
    }
}

/// Owner of the global recorder and all context-scoped recorders
#[derive(Debug)]
pub struct RecorderRegistry {
    global: Arc<Recorder>,
    contexts: DashMap<ContextKey, Arc<Recorder>>,
}

impl RecorderRegistry {
    pub fn new() -> Self {
        info!("Initializing recorder registry");
        Self {
            global: Arc::new(Recorder::global()),
            contexts: DashMap::new(),
        }
    }

    pub fn global(&self) -> &Arc<Recorder> {
        &self.global
    }

    pub fn context(&self, key: ContextKey) -> Option<Arc<Recorder>> {
        self.contexts.get(&key).map(|entry| Arc::clone(entry.value()))
    }

    /// Recorder that statements on `key` should report to
    pub fn current(&self, key: ContextKey) -> Arc<Recorder> {
        self.context(key)
            .unwrap_or_else(|| Arc::clone(&self.global))
    }

    /// Start a fresh recorder for `key`, replacing any previous one
    pub fn begin_context(&self, key: ContextKey) -> Arc<Recorder> {
        let recorder = Arc::new(Recorder::scoped(key, Arc::clone(&self.global)));
        recorder.start();
        if let Some(previous) = self.contexts.insert(key, Arc::clone(&recorder)) {
            warn!("Replacing unfinished recorder for context {}", key);
            previous.stop();
        }
        recorder
    }

    /// Stop and unregister the recorder for `key`
    pub fn end_context(&self, key: ContextKey) -> Option<Arc<Recorder>> {
        let (_, recorder) = self.contexts.remove(&key)?;
        recorder.stop();
        Some(recorder)
    }

    /// Begin a context recording that ends when the returned scope drops
    pub fn scoped(&self, key: ContextKey) -> ContextScope<'_> {
        let recorder = self.begin_context(key);
        ContextScope {
            registry: self,
            key,
            recorder,
        }
    }

    pub fn active_contexts(&self) -> usize {
        self.contexts.len()
    }
}

impl Default for RecorderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A running context recording, torn down on drop
pub struct ContextScope<'a> {
    registry: &'a RecorderRegistry,
    key: ContextKey,
    recorder: Arc<Recorder>,
}

impl ContextScope<'_> {
    pub fn recorder(&self) -> &Arc<Recorder> {
        &self.recorder
    }
}

impl Drop for ContextScope<'_> {
    fn drop(&mut self) {
        self.registry.end_context(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::event::SqlQuery;
    use std::time::Duration;

    fn sql_call() -> Event {
        Event::sql_call(SqlQuery {
            sql: "SELECT 1".to_string(),
            database_type: "sqlite".to_string(),
            server_version: None,
        })
    }

    #[test]
    fn test_lifecycle() {
        let recorder = Recorder::global();
        assert!(!recorder.is_enabled());

        recorder.start();
        recorder.start();
        assert!(recorder.is_enabled());

        let call = sql_call();
        let call_id = call.id;
        recorder.add_event(call).unwrap();
        recorder
            .add_event(Event::returned(call_id, Duration::from_millis(1)))
            .unwrap();

        let trace = recorder.stop();
        assert!(!recorder.is_enabled());
        assert_eq!(trace.len(), 2);
        assert_eq!(trace[1].parent_id, Some(call_id));
    }

    #[test]
    fn test_clear_requires_stopped() {
        let recorder = Recorder::global();
        recorder.start();
        recorder.add_event(sql_call()).unwrap();

        assert!(matches!(recorder.clear(), Err(EngineError::RecorderActive(_))));
        assert_eq!(recorder.len(), 1);

        recorder.stop();
        recorder.clear().unwrap();
        assert!(recorder.is_empty());
    }

    #[test]
    fn test_dangling_parent_rejected() {
        let recorder = Recorder::global();
        let orphan = Event::returned(EventId(u64::MAX), Duration::ZERO);

        let result = recorder.add_event(orphan);
        assert!(matches!(result, Err(EngineError::DanglingParent { .. })));
        assert!(recorder.is_empty());
        assert_eq!(recorder.stats().events_rejected, 1);
    }

    #[test]
    fn test_context_mirrors_into_enabled_global() {
        let registry = RecorderRegistry::new();
        let key = ContextKey(9_001);
        registry.global().start();

        let scoped = registry.begin_context(key);
        scoped.add_event(sql_call()).unwrap();

        assert_eq!(scoped.len(), 1);
        assert_eq!(registry.global().len(), 1);
        assert_eq!(scoped.events()[0].id, registry.global().events()[0].id);
    }

    #[test]
    fn test_context_does_not_mirror_into_disabled_global() {
        let registry = RecorderRegistry::new();
        let scoped = registry.begin_context(ContextKey(9_002));
        scoped.add_event(sql_call()).unwrap();

        assert_eq!(scoped.len(), 1);
        assert!(registry.global().is_empty());
    }

    #[test]
    fn test_current_prefers_context() {
        let registry = RecorderRegistry::new();
        let key = ContextKey(9_003);
        assert_eq!(registry.current(key).id(), RecorderId::Global);

        {
            let scope = registry.scoped(key);
            assert!(scope.recorder().is_enabled());
            assert_eq!(registry.current(key).id(), RecorderId::Context(key));
        }

        assert_eq!(registry.current(key).id(), RecorderId::Global);
        assert_eq!(registry.active_contexts(), 0);
    }

    #[test]
    fn test_concurrent_appends_to_global() {
        let registry = Arc::new(RecorderRegistry::new());
        registry.global().start();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let call = sql_call();
                        let id = call.id;
                        registry.global().add_event(call).unwrap();
                        registry
                            .global()
                            .add_event(Event::returned(id, Duration::ZERO))
                            .unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let events = registry.global().events();
        assert_eq!(events.len(), 800);
        let unique: HashSet<_> = events.iter().map(|e| e.id).collect();
        assert_eq!(unique.len(), 800);
    }
}
