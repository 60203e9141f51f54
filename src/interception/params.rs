// src/interception/params.rs
//! Request parameter extraction
//!
//! Query-string and url-encoded form values are collected per name, JSON
//! object bodies are merged on top, and resolved path parameters replace
//! anything of the same name. A name seen once maps to a scalar; repeated
//! names map to a list. Extraction never fails: bodies that cannot be parsed
//! are ignored.

use crate::recording::event::{MessageParameters, ParamValue};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";
const JSON_CONTENT_TYPE: &str = "application/json";

/// Accumulates parameter values per name, in arrival order
#[derive(Debug, Default)]
pub struct ParamCollector {
    values: BTreeMap<String, Vec<Value>>,
}

impl ParamCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: impl Into<String>, value: Value) {
        self.values.entry(name.into()).or_default().push(value);
    }

    /// Append every pair of an url-encoded string
    pub fn merge_urlencoded(&mut self, encoded: &[u8]) {
        for (name, value) in form_urlencoded::parse(encoded) {
            self.append(name.into_owned(), Value::String(value.into_owned()));
        }
    }

    /// Append the fields of a JSON object body; anything else is ignored
    pub fn merge_json(&mut self, body: &[u8]) {
        match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(fields)) => {
                for (name, value) in fields {
                    self.append(name, value);
                }
            }
            Ok(_) => debug!("Ignoring JSON body that is not an object"),
            Err(e) => debug!("Ignoring malformed JSON body: {}", e),
        }
    }

    /// Collapse single values to scalars
    pub fn finish(self) -> MessageParameters {
        self.values
            .into_iter()
            .map(|(name, mut values)| {
                let value = if values.len() == 1 {
                    ParamValue::Single(values.remove(0))
                } else {
                    ParamValue::Multiple(values)
                };
                (name, value)
            })
            .collect()
    }
}

/// Media type without parameters, lower-cased
fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Extract the parameters of a request
pub fn request_params(query: Option<&str>, content_type: Option<&str>, body: &[u8]) -> MessageParameters {
    let mut collector = ParamCollector::new();

    if let Some(query) = query {
        collector.merge_urlencoded(query.as_bytes());
    }

    let media = content_type.map(media_type).unwrap_or_default();
    if media == FORM_CONTENT_TYPE {
        collector.merge_urlencoded(body);
    } else if media == JSON_CONTENT_TYPE {
        collector.merge_json(body);
    }

    collector.finish()
}

/// Overwrite parameters with resolved path parameters
pub fn merge_path_params(params: &mut MessageParameters, kwargs: &[(String, Value)]) {
    for (name, value) in kwargs {
        params.insert(name.clone(), ParamValue::Single(value.clone()));
    }
}
