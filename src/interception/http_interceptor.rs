// src/interception/http_interceptor.rs
//! Inbound request instrumentation
//!
//! Sits in front of the application handler. For every request it works out
//! which recorders should observe it, emits an `http_server_request` call,
//! runs the handler and emits the matching response or exception event. The
//! handler's response and error values are handed back untouched; a panicking
//! handler gets an exception event and keeps unwinding.

use crate::interception::params::{merge_path_params, request_params};
use crate::interception::path_normalizer::normalize_path;
use crate::interception::remote_control::RemoteControl;
use crate::interception::routing_table::Resolver;
use crate::recording::event::{
    ContextKey, Event, EventId, ExceptionInfo, Headers, HttpServerRequest, HttpServerResponse,
};
use crate::recording::exporter::{Exporter, RequestSummary};
use crate::recording::generation::TraceGenerator;
use crate::recording::metadata::Metadata;
use crate::recording::recorder::{Recorder, RecorderRegistry};
use crate::recording::suspension;
use crate::utils::config::{RecordingConfig, DEFAULT_CONTROL_PATH};
use bytes::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::{HeaderMap, Request, Response};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Framework name registered in trace metadata
pub const FRAMEWORK_NAME: &str = "hyper";
pub const FRAMEWORK_VERSION: &str = "1";

/// Configuration for HTTP interceptor
#[derive(Debug, Clone)]
pub struct InterceptorConfig {
    /// Pass everything through when off
    pub enabled: bool,

    /// Give every request its own context-scoped recorder
    pub record_all_requests: bool,

    /// Reserved path of the remote control surface
    pub control_path: String,

    /// Directory for per-request traces
    pub output_dir: PathBuf,
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            record_all_requests: false,
            control_path: DEFAULT_CONTROL_PATH.to_string(),
            output_dir: PathBuf::from("tmp/appmap"),
        }
    }
}

impl From<&RecordingConfig> for InterceptorConfig {
    fn from(config: &RecordingConfig) -> Self {
        Self {
            enabled: config.enabled,
            record_all_requests: config.record_all_requests,
            control_path: config.control_path.clone(),
            output_dir: config.output_dir.clone(),
        }
    }
}

/// A call event emitted into one recorder
struct OpenCall {
    recorder: Arc<Recorder>,
    call_id: EventId,
    started: Instant,
}

/// HTTP request interceptor
pub struct HttpInterceptor {
    config: InterceptorConfig,
    registry: Arc<RecorderRegistry>,
    resolver: Arc<dyn Resolver>,
    metadata: Arc<Metadata>,
    control: RemoteControl,
    exporter: Exporter,
}

impl HttpInterceptor {
    /// Create a new HTTP interceptor
    pub fn new(
        config: InterceptorConfig,
        registry: Arc<RecorderRegistry>,
        resolver: Arc<dyn Resolver>,
        metadata: Arc<Metadata>,
        generator: Arc<dyn TraceGenerator>,
    ) -> Self {
        let control = RemoteControl::new(Arc::clone(registry.global()), Arc::clone(&generator));
        let exporter = Exporter::new(generator, config.output_dir.clone());

        Self {
            config,
            registry,
            resolver,
            metadata,
            control,
            exporter,
        }
    }

    pub fn control(&self) -> &RemoteControl {
        &self.control
    }

    pub fn registry(&self) -> &Arc<RecorderRegistry> {
        &self.registry
    }

    /// Handle one request through `handler`
    ///
    /// Must run on the thread that executes the handler, so that statements
    /// issued by the handler land in this request's recorder.
    pub fn handle<B, E, F>(&self, req: Request<Bytes>, handler: F) -> Result<Response<B>, E>
    where
        B: From<Bytes>,
        E: fmt::Display,
        F: FnOnce(Request<Bytes>) -> Result<Response<B>, E>,
    {
        if !self.config.enabled {
            return handler(req);
        }

        if req.uri().path() == self.config.control_path {
            return Ok(self.control.handle_http(req.method()).map(B::from));
        }

        if self.config.record_all_requests {
            return self.record_in_context(req, handler);
        }

        let global = self.registry.global();
        if global.is_enabled() {
            // Remote recording only
            return self.record_request(&[Arc::clone(global)], req, handler);
        }

        handler(req)
    }

    /// Record one request into its own recorder and write its trace
    ///
    /// Events reaching the context recorder are mirrored into the global
    /// recorder when a remote recording runs too, so the global recorder is
    /// deliberately not part of the fan-out here.
    fn record_in_context<B, E, F>(&self, req: Request<Bytes>, handler: F) -> Result<Response<B>, E>
    where
        E: fmt::Display,
        F: FnOnce(Request<Bytes>) -> Result<Response<B>, E>,
    {
        let scope = self.registry.scoped(ContextKey::current());
        let recorder = Arc::clone(scope.recorder());

        let method = req.method().to_string();
        let path_info = req.uri().path().to_string();
        let full_path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| path_info.clone());

        let response = self.record_request(&[Arc::clone(&recorder)], req, handler)?;

        recorder.stop();
        let summary = RequestSummary {
            method,
            path_info,
            full_path,
            status_code: response.status().as_u16(),
        };
        if let Err(e) = self.exporter.write_request_trace(&summary, &recorder) {
            warn!("Failed to write request trace: {}", e);
        }

        Ok(response)
    }

    fn record_request<B, E, F>(
        &self,
        recorders: &[Arc<Recorder>],
        req: Request<Bytes>,
        handler: F,
    ) -> Result<Response<B>, E>
    where
        E: fmt::Display,
        F: FnOnce(Request<Bytes>) -> Result<Response<B>, E>,
    {
        let mut open_calls = Vec::with_capacity(recorders.len());

        if recorders.iter().any(|r| r.is_enabled()) {
            self.metadata.add_framework(FRAMEWORK_NAME, FRAMEWORK_VERSION);
            let request = self.describe_request(&req);

            for recorder in recorders.iter().filter(|r| r.is_enabled()) {
                let started = Instant::now();
                let call = Event::http_request(request.clone());
                let call_id = call.id;
                debug!(event = %call_id, recorder = %recorder.id(), "{} {}", request.request_method, request.path_info);

                match recorder.add_event(call) {
                    Ok(()) => open_calls.push(OpenCall {
                        recorder: Arc::clone(recorder),
                        call_id,
                        started,
                    }),
                    Err(e) => warn!("Dropping request event: {}", e),
                }
            }
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(req)));

        match outcome {
            Err(payload) => {
                // Terminate the open calls before the unwind continues
                close_with_exception(&open_calls, || panic_info(&*payload));
                panic::resume_unwind(payload)
            }
            Ok(Err(err)) => {
                close_with_exception(&open_calls, || exception_info(&err));
                Err(err)
            }
            Ok(Ok(response)) => {
                if !open_calls.is_empty() {
                    let headers = header_map(response.headers());
                    for open in open_calls.iter().filter(|o| o.recorder.is_enabled()) {
                        let event = Event::http_response(
                            open.call_id,
                            open.started.elapsed(),
                            HttpServerResponse {
                                status_code: response.status().as_u16(),
                                headers: headers.clone(),
                            },
                        );
                        if let Err(e) = open.recorder.add_event(event) {
                            warn!("Dropping response event: {}", e);
                        }
                    }
                }
                Ok(response)
            }
        }
    }

    /// Build the call payload for a request
    fn describe_request(&self, req: &Request<Bytes>) -> HttpServerRequest {
        let path_info = req.uri().path().to_string();
        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok());
        let mut message = request_params(req.uri().query(), content_type, req.body());

        let normalized_path_info = match self.resolver.resolve(&path_info) {
            Some(resolved) => {
                merge_path_params(&mut message, &resolved.kwargs);
                match normalize_path(&path_info, &resolved) {
                    Ok(normalized) => Some(normalized),
                    // The router matched this path a moment ago
                    Err(e) => panic!("path normalizer disagrees with router: {}", e),
                }
            }
            None => {
                // e.g. an application testing its 404 handling
                debug!("No route for {}, recording without normalized path", path_info);
                None
            }
        };

        HttpServerRequest {
            request_method: req.method().to_string(),
            path_info,
            normalized_path_info,
            message,
            protocol: format!("{:?}", req.version()),
            headers: header_map(req.headers()),
        }
    }
}

/// Flatten headers, joining repeated values with `, `
fn header_map(headers: &HeaderMap) -> Headers {
    let mut flat = Headers::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        flat.entry(name.as_str().to_string())
            .and_modify(|existing: &mut String| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    flat
}

/// Emit one exception event into every recorder still enabled
fn close_with_exception(open_calls: &[OpenCall], info: impl Fn() -> ExceptionInfo) {
    for open in open_calls.iter().filter(|o| o.recorder.is_enabled()) {
        let event = Event::exception(open.call_id, open.started.elapsed(), info());
        if let Err(e) = open.recorder.add_event(event) {
            warn!("Dropping exception event: {}", e);
        }
    }
}

fn exception_info<E: fmt::Display>(err: &E) -> ExceptionInfo {
    ExceptionInfo {
        class: std::any::type_name::<E>().to_string(),
        // Rendering may touch the database; keep that out of the trace
        message: suspension::suspended(|| err.to_string()),
        object_id: err as *const E as usize,
    }
}

fn panic_info(payload: &(dyn Any + Send)) -> ExceptionInfo {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "Box<dyn Any>".to_string());

    ExceptionInfo {
        class: "panic".to_string(),
        message,
        object_id: payload as *const (dyn Any + Send) as *const () as usize,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::connection::InstrumentedConnection;
    use crate::interception::routing_table::{ResolvedRoute, Route, RoutingTable};
    use crate::recording::event::{EventKind, EventPayload, ParamValue};
    use crate::recording::generation::JsonTraceGenerator;
    use hyper::{Method, StatusCode};
    use rusqlite::params;
    use serde_json::json;
    use tempfile::{tempdir, TempDir};

    #[derive(Debug, PartialEq)]
    struct AppError(&'static str);

    impl fmt::Display for AppError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "app failed: {}", self.0)
        }
    }

    struct Fixture {
        interceptor: HttpInterceptor,
        registry: Arc<RecorderRegistry>,
        _dir: TempDir,
    }

    fn fixture(record_all_requests: bool) -> Fixture {
        let dir = tempdir().unwrap();
        let registry = Arc::new(RecorderRegistry::new());
        let routes = RoutingTable::new();
        routes.add_route(Route::path("articles/").unwrap());
        routes.add_route(Route::path("articles/<int:id>").unwrap());
        let metadata = Arc::new(Metadata::new());
        let generator = Arc::new(JsonTraceGenerator::new(Arc::clone(&metadata)));

        let config = InterceptorConfig {
            enabled: true,
            record_all_requests,
            output_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let interceptor = HttpInterceptor::new(
            config,
            Arc::clone(&registry),
            Arc::new(routes),
            metadata,
            generator,
        );

        Fixture {
            interceptor,
            registry,
            _dir: dir,
        }
    }

    fn get(uri: &str) -> Request<Bytes> {
        Request::builder().uri(uri).body(Bytes::new()).unwrap()
    }

    fn ok(_req: Request<Bytes>) -> Result<Response<Bytes>, AppError> {
        let mut response = Response::new(Bytes::from_static(b"ok"));
        response
            .headers_mut()
            .insert("x-app", "demo".parse().unwrap());
        Ok(response)
    }

    fn request_payload(event: &Event) -> &HttpServerRequest {
        match &event.payload {
            EventPayload::HttpServerRequest(request) => request,
            other => panic!("expected request payload, got {:?}", other),
        }
    }

    #[test]
    fn test_disabled_passes_through() {
        let f = fixture(false);
        f.registry.global().start();
        let interceptor = HttpInterceptor::new(
            InterceptorConfig {
                enabled: false,
                ..Default::default()
            },
            Arc::clone(&f.registry),
            Arc::new(RoutingTable::new()),
            Arc::new(Metadata::new()),
            Arc::new(JsonTraceGenerator::new(Arc::new(Metadata::new()))),
        );

        let response = interceptor.handle(get("/articles/1"), ok).unwrap();
        assert_eq!(&response.body()[..], b"ok");
        assert!(f.registry.global().is_empty());
    }

    #[test]
    fn test_no_active_recorder_passes_through() {
        let f = fixture(false);
        let response = f.interceptor.handle(get("/articles/1"), ok).unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(f.registry.global().is_empty());
    }

    #[test]
    fn test_remote_recording_captures_request() {
        let f = fixture(false);
        f.registry.global().start();

        let response = f.interceptor.handle(get("/articles/42?page=2"), ok).unwrap();
        assert_eq!(&response.body()[..], b"ok");

        let events = f.registry.global().events();
        assert_eq!(events.len(), 2);

        let request = request_payload(&events[0]);
        assert_eq!(request.request_method, "GET");
        assert_eq!(request.path_info, "/articles/42");
        assert_eq!(request.normalized_path_info.as_deref(), Some("/articles/{id}"));
        assert_eq!(request.protocol, "HTTP/1.1");
        assert_eq!(request.message.get("page"), Some(&ParamValue::Single(json!("2"))));
        assert_eq!(request.message.get("id"), Some(&ParamValue::Single(json!(42))));

        assert_eq!(events[1].kind, EventKind::Return);
        assert_eq!(events[1].parent_id, Some(events[0].id));
        match &events[1].payload {
            EventPayload::HttpServerResponse(response) => {
                assert_eq!(response.status_code, 200);
                assert_eq!(response.headers.get("x-app").map(String::as_str), Some("demo"));
            }
            other => panic!("expected response payload, got {:?}", other),
        }
    }

    #[test]
    fn test_json_body_merged_with_query() {
        let f = fixture(false);
        f.registry.global().start();

        let req = Request::builder()
            .method(Method::POST)
            .uri("/articles/?page=2")
            .header(CONTENT_TYPE, "application/json")
            .body(Bytes::from_static(br#"{"q": "foo"}"#))
            .unwrap();
        f.interceptor.handle(req, ok).unwrap();

        let events = f.registry.global().events();
        let request = request_payload(&events[0]);
        assert_eq!(request.normalized_path_info.as_deref(), Some("/articles/"));
        assert_eq!(request.message.get("page"), Some(&ParamValue::Single(json!("2"))));
        assert_eq!(request.message.get("q"), Some(&ParamValue::Single(json!("foo"))));
    }

    #[test]
    fn test_unrouted_path_has_no_normalized_path() {
        let f = fixture(false);
        f.registry.global().start();

        let not_found = |_req: Request<Bytes>| -> Result<Response<Bytes>, AppError> {
            let mut response = Response::new(Bytes::new());
            *response.status_mut() = StatusCode::NOT_FOUND;
            Ok(response)
        };
        let response = f.interceptor.handle(get("/missing"), not_found).unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let events = f.registry.global().events();
        assert_eq!(events.len(), 2);
        assert_eq!(request_payload(&events[0]).normalized_path_info, None);
    }

    #[test]
    fn test_handler_error_recorded_and_returned() {
        let f = fixture(false);
        f.registry.global().start();

        let failing = |_req: Request<Bytes>| -> Result<Response<Bytes>, AppError> { Err(AppError("boom")) };
        let result = f.interceptor.handle(get("/articles/1"), failing);
        assert_eq!(result.unwrap_err(), AppError("boom"));

        let events = f.registry.global().events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].kind, EventKind::Exception);
        assert_eq!(events[1].parent_id, Some(events[0].id));
        match &events[1].payload {
            EventPayload::Exception(info) => {
                assert_eq!(info.message, "app failed: boom");
                assert!(info.class.ends_with("AppError"));
            }
            other => panic!("expected exception payload, got {:?}", other),
        }
    }

    #[test]
    fn test_per_request_error_recorded_once() {
        let f = fixture(true);
        f.registry.global().start();

        let mut context = None;
        let failing = |_req: Request<Bytes>| -> Result<Response<Bytes>, AppError> {
            context = f.registry.context(ContextKey::current());
            Err(AppError("boom"))
        };
        let result = f.interceptor.handle(get("/articles/1"), failing);
        assert_eq!(result.unwrap_err(), AppError("boom"));

        let context = context.expect("context recorder active during the handler");
        let scoped = context.events();
        assert_eq!(scoped.len(), 2);
        assert_eq!(scoped[1].kind, EventKind::Exception);
        assert_eq!(scoped[1].parent_id, Some(scoped[0].id));

        // Mirrored exactly once
        assert_eq!(f.registry.global().events(), scoped);
        assert_eq!(f.registry.active_contexts(), 0);
        assert!(!f._dir.path().join("requests").exists());
    }

    #[test]
    fn test_per_request_error_without_remote_session() {
        let f = fixture(true);

        let mut context = None;
        let failing = |_req: Request<Bytes>| -> Result<Response<Bytes>, AppError> {
            context = f.registry.context(ContextKey::current());
            Err(AppError("boom"))
        };
        assert!(f.interceptor.handle(get("/articles/1"), failing).is_err());

        let events = context.unwrap().events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].kind, EventKind::Exception);
        assert!(f.registry.global().is_empty());
    }

    #[test]
    fn test_handler_panic_closes_request() {
        let f = fixture(false);
        f.registry.global().start();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            f.interceptor
                .handle(get("/articles/1"), |_req| -> Result<Response<Bytes>, AppError> {
                    panic!("boom")
                })
        }));
        assert!(result.is_err());

        let events = f.registry.global().events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].kind, EventKind::Exception);
        assert_eq!(events[1].parent_id, Some(events[0].id));
        match &events[1].payload {
            EventPayload::Exception(info) => {
                assert_eq!(info.class, "panic");
                assert_eq!(info.message, "boom");
            }
            other => panic!("expected exception payload, got {:?}", other),
        }
    }

    #[test]
    fn test_handler_panic_in_per_request_mode() {
        let f = fixture(true);
        f.registry.global().start();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            f.interceptor
                .handle(get("/articles/1"), |_req| -> Result<Response<Bytes>, AppError> {
                    panic!("{}", String::from("boom"))
                })
        }));
        assert!(result.is_err());

        let events = f.registry.global().events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].kind, EventKind::Exception);
        assert_eq!(f.registry.active_contexts(), 0);
    }

    #[test]
    fn test_unanchored_regex_route() {
        let registry = Arc::new(RecorderRegistry::new());
        registry.global().start();
        let routes = RoutingTable::new();
        routes.add_route(Route::regex(r"(?P<id>[0-9]+)/$").unwrap());
        let metadata = Arc::new(Metadata::new());
        let interceptor = HttpInterceptor::new(
            InterceptorConfig::default(),
            Arc::clone(&registry),
            Arc::new(routes),
            Arc::clone(&metadata),
            Arc::new(JsonTraceGenerator::new(metadata)),
        );

        interceptor.handle(get("/items/42/"), ok).unwrap();
        interceptor.handle(get("/42/"), ok).unwrap();

        let events = registry.global().events();
        assert_eq!(events.len(), 4);
        assert_eq!(request_payload(&events[0]).normalized_path_info, None);

        let request = request_payload(&events[2]);
        assert_eq!(request.normalized_path_info.as_deref(), Some("/{id}/"));
        assert_eq!(request.message.get("id"), Some(&ParamValue::Single(json!("42"))));
    }

    #[test]
    fn test_per_request_recording_writes_trace() {
        let f = fixture(true);

        f.interceptor.handle(get("/articles/7"), ok).unwrap();

        assert!(f.registry.global().is_empty());
        assert_eq!(f.registry.active_contexts(), 0);

        let written: Vec<_> = std::fs::read_dir(f._dir.path().join("requests"))
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        assert_eq!(written.len(), 1);

        let trace: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&written[0]).unwrap()).unwrap();
        let events = trace["events"].as_array().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["http_server_request"]["normalized_path_info"], "/articles/{id}");
        assert_eq!(events[1]["http_server_response"]["status_code"], 200);
        assert_eq!(trace["metadata"]["frameworks"][0]["name"], FRAMEWORK_NAME);
    }

    #[test]
    fn test_remote_and_per_request_do_not_duplicate() {
        let f = fixture(true);
        f.registry.global().start();

        f.interceptor.handle(get("/articles/7"), ok).unwrap();

        let events = f.registry.global().events();
        assert_eq!(events.len(), 2);
        assert_ne!(events[0].id, events[1].id);
        assert_eq!(events[1].parent_id, Some(events[0].id));
    }

    #[test]
    fn test_statements_nest_inside_request() {
        let f = fixture(true);
        f.registry.global().start();
        let conn = InstrumentedConnection::open_in_memory(Arc::clone(&f.registry), Arc::new(Metadata::new()))
            .unwrap();

        let handler = |_req: Request<Bytes>| -> Result<Response<Bytes>, AppError> {
            conn.query_rows("SELECT 1", params![], |row| row.get::<_, i64>(0))
                .map_err(|_| AppError("query"))?;
            Ok(Response::new(Bytes::new()))
        };
        f.interceptor.handle(get("/articles/"), handler).unwrap();

        let kinds: Vec<_> = f
            .registry
            .global()
            .events()
            .iter()
            .map(|e| match e.payload {
                EventPayload::HttpServerRequest(_) => "request",
                EventPayload::SqlQuery(_) => "sql",
                EventPayload::Return => "return",
                EventPayload::HttpServerResponse(_) => "response",
                EventPayload::Exception(_) => "exception",
            })
            .collect();
        assert_eq!(kinds, vec!["request", "sql", "return", "response"]);
    }

    #[test]
    fn test_control_path_routed_to_remote_control() {
        let f = fixture(false);

        let start = Request::builder()
            .method(Method::POST)
            .uri(DEFAULT_CONTROL_PATH)
            .body(Bytes::new())
            .unwrap();
        let response = f
            .interceptor
            .handle(start, |_req| -> Result<Response<Bytes>, AppError> {
                panic!("control requests never reach the application")
            })
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(f.registry.global().is_enabled());
        assert!(f.interceptor.control().status());
    }

    struct LyingResolver;

    impl Resolver for LyingResolver {
        fn resolve(&self, _path: &str) -> Option<ResolvedRoute> {
            Some(ResolvedRoute {
                route: "articles/<int:id>".to_string(),
                kwargs: vec![("id".to_string(), json!(1))],
                name: None,
            })
        }
    }

    #[test]
    #[should_panic(expected = "path normalizer disagrees with router")]
    fn test_normalizer_mismatch_is_fatal() {
        let registry = Arc::new(RecorderRegistry::new());
        registry.global().start();
        let metadata = Arc::new(Metadata::new());
        let interceptor = HttpInterceptor::new(
            InterceptorConfig::default(),
            registry,
            Arc::new(LyingResolver),
            Arc::clone(&metadata),
            Arc::new(JsonTraceGenerator::new(metadata)),
        );

        let _ = interceptor.handle(get("/comments/1"), ok);
    }
}
