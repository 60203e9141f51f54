// src/interception/remote_control.rs
//! Remote recording control
//!
//! Lets an external client start and stop the global recorder over HTTP:
//!
//! | Method   | Effect                                   | Failure            |
//! |----------|------------------------------------------|--------------------|
//! | `GET`    | `{"enabled": bool}`                      |                    |
//! | `POST`   | clear the log and start recording        | 409 when recording |
//! | `DELETE` | stop recording, respond with the trace   | 404 when idle      |

use crate::recording::generation::TraceGenerator;
use crate::recording::recorder::Recorder;
use bytes::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Method, Response, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("Recording is already in progress")]
    AlreadyRecording,

    #[error("No recording is in progress")]
    NotRecording,

    #[error("Failed to generate trace: {0}")]
    Generation(String),
}

impl ControlError {
    pub fn status(&self) -> StatusCode {
        match self {
            ControlError::AlreadyRecording => StatusCode::CONFLICT,
            ControlError::NotRecording => StatusCode::NOT_FOUND,
            ControlError::Generation(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Start/stop/status surface over one recorder
pub struct RemoteControl {
    recorder: Arc<Recorder>,
    generator: Arc<dyn TraceGenerator>,
}

impl RemoteControl {
    pub fn new(recorder: Arc<Recorder>, generator: Arc<dyn TraceGenerator>) -> Self {
        Self {
            recorder,
            generator,
        }
    }

    pub fn status(&self) -> bool {
        self.recorder.is_enabled()
    }

    /// Clear previous events and start recording
    pub fn start(&self) -> Result<(), ControlError> {
        if self.recorder.is_enabled() {
            return Err(ControlError::AlreadyRecording);
        }
        // Fails only if another caller started in the meantime
        self.recorder
            .clear()
            .map_err(|_| ControlError::AlreadyRecording)?;
        self.recorder.start();

        info!("Remote recording started");
        Ok(())
    }

    /// Stop recording and return the trace
    pub fn stop(&self) -> Result<Value, ControlError> {
        if !self.recorder.is_enabled() {
            return Err(ControlError::NotRecording);
        }
        self.recorder.stop();
        info!("Remote recording stopped with {} events", self.recorder.len());

        self.generator
            .dump(&self.recorder)
            .map_err(|e| ControlError::Generation(e.to_string()))
    }

    /// Answer a request for the control path
    pub fn handle_http(&self, method: &Method) -> Response<Bytes> {
        match *method {
            Method::GET => json_response(StatusCode::OK, &json!({ "enabled": self.status() })),
            Method::POST => match self.start() {
                Ok(()) => text_response(StatusCode::OK, ""),
                Err(e) => error_response(&e),
            },
            Method::DELETE => match self.stop() {
                Ok(trace) => json_response(StatusCode::OK, &trace),
                Err(e) => error_response(&e),
            },
            _ => text_response(StatusCode::BAD_REQUEST, ""),
        }
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
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

fn error_response(error: &ControlError) -> Response<Bytes> {
    warn!("Recording control request rejected: {}", error);
    text_response(error.status(), &error.to_string())
}
