// src/main.rs
//! ExecMap demo server
//!
//! Serves a small articles application over an instrumented SQLite
//! connection. With recording enabled, `POST /_appmap/record` starts a
//! remote recording and `DELETE /_appmap/record` returns the trace; with
//! `record_all_requests` every request is also written to its own file.

use anyhow::{Context, Result};
use bytes::Bytes;
use execmap_engine::database::InstrumentedConnection;
use execmap_engine::interception::params::request_params;
use execmap_engine::interception::{HttpInterceptor, InterceptorConfig, Route, RoutingTable};
use execmap_engine::observability::init_tracing;
use execmap_engine::recording::{JsonTraceGenerator, Metadata, RecorderRegistry};
use execmap_engine::recording::event::ParamValue;
use execmap_engine::utils::config::EngineConfig;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use rusqlite::params;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS articles (
    id INTEGER PRIMARY KEY,
    title TEXT NOT NULL
);";

#[derive(Debug, Error)]
enum AppError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("bad request: {0}")]
    BadRequest(String),
}

/// Demo application state
struct App {
    interceptor: HttpInterceptor,
    db: Mutex<InstrumentedConnection>,
}

impl App {
    fn handle(&self, req: Request<Bytes>) -> Result<Response<Bytes>, AppError> {
        let path = req.uri().path();

        match (req.method(), path) {
            (&Method::GET, "/articles/") => self.list_articles(),
            (&Method::POST, "/articles/") => self.create_article(&req),
            (&Method::GET, _) => match path.strip_prefix("/articles/").map(str::parse::<i64>) {
                Some(Ok(id)) => self.show_article(id),
                _ => Ok(text_response(StatusCode::NOT_FOUND, "Not Found")),
            },
            _ => Ok(text_response(StatusCode::NOT_FOUND, "Not Found")),
        }
    }

    fn list_articles(&self) -> Result<Response<Bytes>, AppError> {
        let articles = self.db.lock().query_rows(
            "SELECT id, title FROM articles ORDER BY id",
            params![],
            |row| Ok(json!({ "id": row.get::<_, i64>(0)?, "title": row.get::<_, String>(1)? })),
        )?;
        Ok(json_response(StatusCode::OK, &Value::from(articles)))
    }

    fn show_article(&self, id: i64) -> Result<Response<Bytes>, AppError> {
        let mut found = self.db.lock().query_rows(
            "SELECT id, title FROM articles WHERE id = ?1",
            params![id],
            |row| Ok(json!({ "id": row.get::<_, i64>(0)?, "title": row.get::<_, String>(1)? })),
        )?;

        match found.pop() {
            Some(article) => Ok(json_response(StatusCode::OK, &article)),
            None => Ok(text_response(StatusCode::NOT_FOUND, "Not Found")),
        }
    }

    fn create_article(&self, req: &Request<Bytes>) -> Result<Response<Bytes>, AppError> {
        let content_type = req.headers().get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
        let params = request_params(None, content_type, req.body());

        let title = match params.get("title") {
            Some(ParamValue::Single(Value::String(title))) => title.clone(),
            _ => return Err(AppError::BadRequest("missing title".to_string())),
        };

        let db = self.db.lock();
        db.execute("INSERT INTO articles (title) VALUES (?1)", params![title])?;
        let id = db.query_rows("SELECT last_insert_rowid()", params![], |row| row.get::<_, i64>(0))?;

        Ok(json_response(
            StatusCode::CREATED,
            &json!({ "id": id.first().copied(), "title": title }),
        ))
    }
}

fn json_response(status: StatusCode, body: &Value) -> Response<Bytes> {
    let mut response = Response::new(Bytes::from(body.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn text_response(status: StatusCode, body: &str) -> Response<Bytes> {
    let mut response = Response::new(Bytes::from(body.to_string()));
    *response.status_mut() = status;
    response
}

/// Buffer the body and run the instrumented handler on a blocking thread
async fn serve(app: Arc<App>, req: Request<Incoming>) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let (parts, body) = req.into_parts();
    let body = body.collect().await?.to_bytes();
    let req = Request::from_parts(parts, body);

    let outcome = tokio::task::spawn_blocking(move || {
        app.interceptor.handle(req, |req| app.handle(req))
    })
    .await;

    let response = match outcome {
        Ok(Ok(response)) => response,
        Ok(Err(AppError::BadRequest(message))) => text_response(StatusCode::BAD_REQUEST, &message),
        Ok(Err(e)) => {
            error!("Handler failed: {}", e);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
        Err(e) => {
            error!("Handler panicked: {}", e);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    };

    Ok(response.map(Full::new))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    info!("Starting ExecMap demo server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = EngineConfig::load()?;
    info!("Configuration loaded: {:?}", config);

    let registry = Arc::new(RecorderRegistry::new());
    let metadata = Arc::new(Metadata::new());
    let generator = Arc::new(JsonTraceGenerator::new(Arc::clone(&metadata)));

    let routes = RoutingTable::new();
    routes.add_route(Route::path("articles/")?.with_name("article-list"));
    routes.add_route(Route::path("articles/<int:id>")?.with_name("article-detail"));

    let db = if config.server.database == ":memory:" {
        InstrumentedConnection::open_in_memory(Arc::clone(&registry), Arc::clone(&metadata))
    } else {
        InstrumentedConnection::open(
            &config.server.database,
            Arc::clone(&registry),
            Arc::clone(&metadata),
        )
    }
    .context("Failed to open database")?;
    db.execute_script(SCHEMA).context("Failed to create schema")?;

    let interceptor = HttpInterceptor::new(
        InterceptorConfig::from(&config.recording),
        Arc::clone(&registry),
        Arc::new(routes),
        metadata,
        generator,
    );
    let app = Arc::new(App {
        interceptor,
        db: Mutex::new(db),
    });

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!(
        "Listening on {} (recording {}, per-request {})",
        addr, config.recording.enabled, config.recording.record_all_requests
    );

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let app = Arc::clone(&app);

                    tokio::spawn(async move {
                        debug!("Accepted connection from {}", peer);

                        let io = TokioIo::new(stream);
                        let service = service_fn(move |req| serve(Arc::clone(&app), req));

                        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                            error!("Connection error: {}", e);
                        }
                    });
                }
                Err(e) => error!("Failed to accept connection: {}", e),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, cleaning up...");
                break;
            }
        }
    }

    Ok(())
}
