// src/interception/routing_table.rs
//! Routing table mapping request paths to routes
//!
//! Routes are either path templates (`articles/<int:id>`, `tags/{name}`) or
//! regular expressions with named groups (`^archive/(?P<year>[0-9]{4})/$`).
//! Paths are matched without their leading `/`, and always from the start.

use crate::utils::errors::{EngineError, Result};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, info};

static TEMPLATE_PARAM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<(?:(?P<conv>\w+):)?(?P<name>\w+)>|\{(?P<bname>\w+)(?::(?P<bconv>\w+))?\}")
        .expect("template parameter regex is valid")
});

/// How a route was declared
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutePattern {
    Template(String),
    Regex(String),
}

impl RoutePattern {
    pub fn as_str(&self) -> &str {
        match self {
            RoutePattern::Template(s) | RoutePattern::Regex(s) => s,
        }
    }
}

/// Route definition
#[derive(Debug, Clone)]
pub struct Route {
    /// Pattern as declared
    pub pattern: RoutePattern,

    /// Optional route name
    pub name: Option<String>,

    matcher: Regex,
    int_params: Vec<String>,
}

impl Route {
    /// Route from a path template
    pub fn path(template: impl Into<String>) -> Result<Self> {
        let template = template.into();
        let converted = route_to_regex(&template)?;
        let matcher = compile(&format!("^(?:{})\\z", converted.pattern), &template)?;

        Ok(Self {
            pattern: RoutePattern::Template(template),
            name: None,
            matcher,
            int_params: converted.int_params,
        })
    }

    /// Route from a regular expression with named groups
    ///
    /// The expression is matched from the start of the path, whether or not
    /// it begins with `^`.
    pub fn regex(pattern: impl Into<String>) -> Result<Self> {
        let pattern = pattern.into();
        let matcher = compile(&format!("^(?:{})", pattern), &pattern)?;

        Ok(Self {
            pattern: RoutePattern::Regex(pattern),
            name: None,
            matcher,
            int_params: Vec::new(),
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Match a path (without leading `/`), returning its named parameters
    fn matches(&self, path: &str) -> Option<Vec<(String, Value)>> {
        let captures = self.matcher.captures(path)?;

        let kwargs = self
            .matcher
            .capture_names()
            .flatten()
            .filter_map(|name| {
                let text = captures.name(name)?.as_str();
                let value = if self.int_params.iter().any(|p| p == name) {
                    text.parse::<i64>()
                        .map(Value::from)
                        .unwrap_or_else(|_| Value::from(text))
                } else {
                    Value::from(text)
                };
                Some((name.to_string(), value))
            })
            .collect();

        Some(kwargs)
    }
}

/// A successful route resolution
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRoute {
    /// Route text as the router reports it: a template or a regex
    pub route: String,

    /// Named path parameters in declaration order
    pub kwargs: Vec<(String, Value)>,

    pub name: Option<String>,
}

/// Resolves request paths to routes
pub trait Resolver: Send + Sync {
    fn resolve(&self, path: &str) -> Option<ResolvedRoute>;
}

/// Output of [`route_to_regex`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertedRoute {
    /// Unanchored regex with one named group per parameter
    pub pattern: String,

    /// Parameters declared with the `int` converter
    pub int_params: Vec<String>,
}

/// Convert a path template into a regular expression
///
/// Parameters are written `<name>`, `<converter:name>`, `{name}` or
/// `{name:converter}`. Supported converters: `str` (default), `int`, `slug`,
/// `uuid` and `path`.
pub fn route_to_regex(template: &str) -> Result<ConvertedRoute> {
    let mut pattern = String::with_capacity(template.len() * 2);
    let mut int_params = Vec::new();
    let mut last = 0;

    for caps in TEMPLATE_PARAM.captures_iter(template) {
        let Some(whole) = caps.get(0) else { continue };
        let name = caps
            .name("name")
            .or_else(|| caps.name("bname"))
            .map(|m| m.as_str())
            .unwrap_or_default();
        let converter = caps
            .name("conv")
            .or_else(|| caps.name("bconv"))
            .map(|m| m.as_str())
            .unwrap_or("str");

        let class = converter_regex(converter).ok_or_else(|| EngineError::InvalidRoute {
            pattern: template.to_string(),
            reason: format!("unknown converter {:?}", converter),
        })?;
        if converter == "int" {
            int_params.push(name.to_string());
        }

        pattern.push_str(&regex::escape(&template[last..whole.start()]));
        pattern.push_str(&format!("(?P<{}>{})", name, class));
        last = whole.end();
    }
    pattern.push_str(&regex::escape(&template[last..]));

    Ok(ConvertedRoute {
        pattern,
        int_params,
    })
}

fn converter_regex(converter: &str) -> Option<&'static str> {
    match converter {
        "str" => Some("[^/]+"),
        "int" => Some("[0-9]+"),
        "slug" => Some("[-a-zA-Z0-9_]+"),
        "uuid" => Some("[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}"),
        "path" => Some(".+"),
        _ => None,
    }
}

fn compile(regex: &str, declared: &str) -> Result<Regex> {
    Regex::new(regex).map_err(|e| EngineError::InvalidRoute {
        pattern: declared.to_string(),
        reason: e.to_string(),
    })
}

/// Ordered routing table; the first matching route wins
pub struct RoutingTable {
    routes: RwLock<Vec<Route>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(Vec::new()),
        }
    }

    /// Add a route
    pub fn add_route(&self, route: Route) {
        info!("Adding route: {}", route.pattern.as_str());
        self.routes.write().push(route);
    }

    pub fn routes(&self) -> Vec<Route> {
        self.routes.read().clone()
    }

    pub fn clear_routes(&self) {
        self.routes.write().clear();
        info!("Cleared all routes");
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Resolver for RoutingTable {
    fn resolve(&self, path: &str) -> Option<ResolvedRoute> {
        let target = path.strip_prefix('/').unwrap_or(path);
        let routes = self.routes.read();

        for route in routes.iter() {
            if let Some(kwargs) = route.matches(target) {
                debug!("Resolved {} to {}", path, route.pattern.as_str());
                return Some(ResolvedRoute {
                    route: route.pattern.as_str().to_string(),
                    kwargs,
                    name: route.name.clone(),
                });
            }
        }

        debug!("No route found for {}", path);
        None
    }
}
