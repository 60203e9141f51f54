// src/recording/metadata.rs
//! Process-wide trace metadata

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Framework {
    pub name: String,
    pub version: String,
}

/// Accumulates the frameworks observed while recording
#[derive(Debug, Default)]
pub struct Metadata {
    frameworks: Mutex<Vec<Framework>>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a framework; repeated registrations are ignored
    pub fn add_framework(&self, name: &str, version: &str) {
        let mut frameworks = self.frameworks.lock();
        if !frameworks.iter().any(|f| f.name == name && f.version == version) {
            frameworks.push(Framework {
                name: name.to_string(),
                version: version.to_string(),
            });
        }
    }

    pub fn frameworks(&self) -> Vec<Framework> {
        self.frameworks.lock().clone()
    }
}
