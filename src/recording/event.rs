// src/recording/event.rs
//! Trace events
//!
//! Every event is either a `call`, or a `return`/`exception` that points back
//! at the call it terminates through `parent_id`. Ids come from one process
//! wide counter, so they are unique across all recorders.

use crate::database::version::DatabaseVersion;
use serde::Serialize;
use serde_json::{json, Value};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_CONTEXT_KEY: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CONTEXT_KEY: Cell<u64> = const { Cell::new(0) };
}

/// Process-unique event identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct EventId(pub u64);

impl EventId {
    /// Allocate the next id
    pub fn next() -> Self {
        EventId(NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a logical execution context (one per thread)
///
/// Keys are small sequential numbers handed out on first use, so they are
/// stable for the thread's lifetime and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ContextKey(pub u64);

impl ContextKey {
    /// Key of the calling thread
    pub fn current() -> Self {
        CONTEXT_KEY.with(|key| {
            if key.get() == 0 {
                key.set(NEXT_CONTEXT_KEY.fetch_add(1, Ordering::Relaxed));
            }
            ContextKey(key.get())
        })
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Call,
    Return,
    Exception,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Call => "call",
            EventKind::Return => "return",
            EventKind::Exception => "exception",
        }
    }
}

/// A request parameter value: one scalar, or a list when the name repeats
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Single(Value),
    Multiple(Vec<Value>),
}

/// Request parameters keyed by name
pub type MessageParameters = BTreeMap<String, ParamValue>;

/// Header names (lower-case) to values
pub type Headers = BTreeMap<String, String>;

/// A database statement
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SqlQuery {
    /// Statement text, or `"<count> times <sql>"` for batches
    pub sql: String,

    /// Backend vendor, e.g. `sqlite`
    pub database_type: String,

    pub server_version: Option<DatabaseVersion>,
}

/// An inbound HTTP request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HttpServerRequest {
    pub request_method: String,
    pub path_info: String,

    /// Path with dynamic segments replaced by `{name}`; `None` when no route matched
    pub normalized_path_info: Option<String>,

    pub message: MessageParameters,
    pub protocol: String,
    pub headers: Headers,
}

/// The response to an [`HttpServerRequest`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HttpServerResponse {
    pub status_code: u16,
    pub headers: Headers,
}

/// Captured error that terminated a call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExceptionInfo {
    pub class: String,
    pub message: String,

    /// Address of the error value at capture time
    pub object_id: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    SqlQuery(SqlQuery),
    HttpServerRequest(HttpServerRequest),
    HttpServerResponse(HttpServerResponse),
    Exception(ExceptionInfo),
    Return,
}

/// One trace event
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: EventId,
    pub kind: EventKind,
    pub thread_id: ContextKey,

    /// Call this event terminates; set on return and exception events
    pub parent_id: Option<EventId>,

    /// Time since the parent call; set on return and exception events
    pub elapsed: Option<Duration>,

    pub payload: EventPayload,
}

impl Event {
    fn new(kind: EventKind, parent_id: Option<EventId>, elapsed: Option<Duration>, payload: EventPayload) -> Self {
        Self {
            id: EventId::next(),
            kind,
            thread_id: ContextKey::current(),
            parent_id,
            elapsed,
            payload,
        }
    }

    pub fn sql_call(query: SqlQuery) -> Self {
        Self::new(EventKind::Call, None, None, EventPayload::SqlQuery(query))
    }

    pub fn http_request(request: HttpServerRequest) -> Self {
        Self::new(EventKind::Call, None, None, EventPayload::HttpServerRequest(request))
    }

    /// Plain return from `parent`
    pub fn returned(parent: EventId, elapsed: Duration) -> Self {
        Self::new(EventKind::Return, Some(parent), Some(elapsed), EventPayload::Return)
    }

    pub fn http_response(parent: EventId, elapsed: Duration, response: HttpServerResponse) -> Self {
        Self::new(
            EventKind::Return,
            Some(parent),
            Some(elapsed),
            EventPayload::HttpServerResponse(response),
        )
    }

    pub fn exception(parent: EventId, elapsed: Duration, info: ExceptionInfo) -> Self {
        Self::new(
            EventKind::Exception,
            Some(parent),
            Some(elapsed),
            EventPayload::Exception(info),
        )
    }

    pub fn is_call(&self) -> bool {
        self.kind == EventKind::Call
    }

    /// JSON shape used in serialized traces
    pub fn to_json(&self) -> Value {
        let mut object = json!({
            "id": self.id,
            "event": self.kind.as_str(),
            "thread_id": self.thread_id,
        });

        if let Some(parent_id) = self.parent_id {
            object["parent_id"] = json!(parent_id);
        }
        if let Some(elapsed) = self.elapsed {
            object["elapsed"] = json!(elapsed.as_secs_f64());
        }

        match &self.payload {
            EventPayload::SqlQuery(query) => object["sql_query"] = json!(query),
            EventPayload::HttpServerRequest(request) => {
                object["http_server_request"] = json!({
                    "request_method": request.request_method,
                    "path_info": request.path_info,
                    "normalized_path_info": request.normalized_path_info,
                    "protocol": request.protocol,
                    "headers": request.headers,
                });
                object["message"] = request
                    .message
                    .iter()
                    .map(|(name, value)| json!({ "name": name, "value": value }))
                    .collect();
            }
            EventPayload::HttpServerResponse(response) => {
                object["http_server_response"] = json!(response);
            }
            EventPayload::Exception(info) => object["exceptions"] = json!([info]),
            EventPayload::Return => {}
        }

        object
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_increasing() {
        let a = EventId::next();
        let b = EventId::next();
        assert!(b > a);
    }

    #[test]
    fn test_context_key_is_per_thread() {
        let here = ContextKey::current();
        assert_eq!(here, ContextKey::current());

        let there = std::thread::spawn(ContextKey::current).join().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn test_return_links_to_call() {
        let call = Event::sql_call(SqlQuery {
            sql: "SELECT 1".to_string(),
            database_type: "sqlite".to_string(),
            server_version: None,
        });
        let ret = Event::returned(call.id, Duration::from_millis(2));

        assert!(call.is_call());
        assert_eq!(ret.kind, EventKind::Return);
        assert_eq!(ret.parent_id, Some(call.id));
        assert!(ret.id > call.id);
    }

    #[test]
    fn test_json_shape() {
        let mut message = MessageParameters::new();
        message.insert("page".to_string(), ParamValue::Single(json!("2")));
        message.insert(
            "tag".to_string(),
            ParamValue::Multiple(vec![json!("a"), json!("b")]),
        );

        let call = Event::http_request(HttpServerRequest {
            request_method: "GET".to_string(),
            path_info: "/articles/42".to_string(),
            normalized_path_info: Some("/articles/{id}".to_string()),
            message,
            protocol: "HTTP/1.1".to_string(),
            headers: Headers::new(),
        });
        let value = call.to_json();

        assert_eq!(value["event"], "call");
        assert!(value.get("parent_id").is_none());
        assert_eq!(value["http_server_request"]["normalized_path_info"], "/articles/{id}");
        assert_eq!(value["message"][0]["name"], "page");
        assert_eq!(value["message"][1]["value"], json!(["a", "b"]));

        let ret = Event::returned(call.id, Duration::from_millis(500));
        let value = ret.to_json();
        assert_eq!(value["event"], "return");
        assert_eq!(value["parent_id"], json!(call.id.0));
        assert_eq!(value["elapsed"], json!(0.5));
    }
}
