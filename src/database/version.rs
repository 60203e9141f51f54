// src/database/version.rs
//! Backend vendor and version resolution

use serde::Serialize;

/// Normalized server version
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum DatabaseVersion {
    /// `(major, minor, patch)`
    Triple(u32, u32, u32),

    /// Version string the backend reported as-is
    Opaque(String),
}

/// Version as reported by a driver, before normalization
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawVersion {
    /// Packed integer, e.g. `120005` for postgres or `3040001` for sqlite
    Number(u32),
    Tuple(u32, u32, u32),
    Text(String),
}

/// Turn a postgres version number like 120005 into 12.0.5
pub fn parse_pg_version(version: u32) -> DatabaseVersion {
    DatabaseVersion::Triple(version / 10000 % 100, version / 100 % 100, version % 100)
}

/// Turn a sqlite version number like 3040001 into 3.40.1
pub fn parse_sqlite_version(version: u32) -> DatabaseVersion {
    DatabaseVersion::Triple(version / 1_000_000, version / 1000 % 1000, version % 1000)
}

/// Establish the backend version for `vendor`
///
/// Unknown vendors, and raw values a vendor never reports, yield `None`.
pub fn database_version(vendor: &str, raw: Option<RawVersion>) -> Option<DatabaseVersion> {
    match (vendor, raw?) {
        ("sqlite", RawVersion::Number(n)) => Some(parse_sqlite_version(n)),
        ("postgresql", RawVersion::Number(n)) => Some(parse_pg_version(n)),
        ("sqlite" | "mysql" | "postgresql" | "oracle", RawVersion::Tuple(major, minor, patch)) => {
            Some(DatabaseVersion::Triple(major, minor, patch))
        }
        ("mysql" | "oracle", RawVersion::Text(text)) => Some(DatabaseVersion::Opaque(text)),
        _ => None,
    }
}
