// src/interception/path_normalizer.rs
//! Path normalization
//!
//! Replaces the dynamic segments of a request path with the names of the
//! route parameters they matched: `/articles/42` resolved through
//! `articles/<int:id>` becomes `/articles/{id}`.

use crate::interception::routing_table::{route_to_regex, ResolvedRoute};
use crate::utils::errors::{EngineError, Result};
use regex::{Captures, Regex};

/// Normalize `path_info` against the route it resolved to
///
/// Fails only when the route cannot be made to match the path again, which
/// means the normalizer and the router disagree.
pub fn normalize_path(path_info: &str, resolved: &ResolvedRoute) -> Result<String> {
    if resolved.kwargs.is_empty() {
        return Ok(path_info.to_string());
    }

    // The router matches paths without their leading separator
    let target = path_info.strip_prefix('/').unwrap_or(path_info);
    let (regex, captures) = resolved_match(target, &resolved.route)?;

    let mut normalized = String::with_capacity(path_info.len());
    normalized.push('/');
    let mut pos = 0;

    for (index, name) in regex.capture_names().enumerate() {
        let Some(name) = name else { continue };
        let Some(group) = captures.get(index) else { continue };
        if group.start() < pos {
            // Nested inside a group that was already replaced
            continue;
        }

        normalized.push_str(&target[pos..group.start()]);
        normalized.push('{');
        normalized.push_str(name);
        normalized.push('}');
        pos = group.end();
    }

    normalized.push_str(&target[pos..]);
    Ok(normalized)
}

/// Find the regex the router used for `route` and match it against `target`
///
/// The route text is tried as a regex first; if that does not compile or
/// does not match, it is treated as a path template.
fn resolved_match<'t>(target: &'t str, route: &str) -> Result<(Regex, Captures<'t>)> {
    if let Ok(regex) = anchored(route) {
        if let Some(captures) = regex.captures(target) {
            return Ok((regex, captures));
        }
    }

    let template = route.strip_prefix('^').unwrap_or(route);
    let converted = route_to_regex(template)?;
    let regex = anchored(&converted.pattern).map_err(|e| EngineError::InvalidRoute {
        pattern: route.to_string(),
        reason: e.to_string(),
    })?;

    match regex.captures(target) {
        Some(captures) => Ok((regex, captures)),
        None => Err(EngineError::NormalizerMismatch {
            path: target.to_string(),
            regex: converted.pattern,
        }),
    }
}

fn anchored(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{})", pattern))
}
