//! ChangeRecord - one normalized notification from an upstream feed.

use serde::{Deserialize, Serialize};

use super::cursor::Cursor;

/// Ephemeral; never persisted. Produced by a registry source, consumed by
/// ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Position of this record in its source.
    pub cursor: Cursor,

    /// Package identity, e.g. `@scope/name` or `name`.
    pub fullname: String,

    pub deleted: bool,

    /// Versions this change is known to touch. Empty means "unknown", which
    /// downstream treats as "sync everything".
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub versions: Vec<String>,

    /// The vendor payload as received.
    pub raw: serde_json::Value,
}

impl ChangeRecord {
    pub fn new(cursor: Cursor, fullname: impl Into<String>, raw: serde_json::Value) -> Self {
        Self {
            cursor,
            fullname: fullname.into(),
            deleted: false,
            versions: Vec::new(),
            raw,
        }
    }

    pub fn deleted(mut self, deleted: bool) -> Self {
        self.deleted = deleted;
        self
    }

    pub fn with_versions(mut self, versions: Vec<String>) -> Self {
        self.versions = versions;
        self
    }

    /// `@scope` of a scoped package name, `None` for unscoped names.
    pub fn scope(&self) -> Option<&str> {
        package_scope(&self.fullname)
    }
}

/// Scope part of a package name: `@foo/bar` -> `@foo`.
pub fn package_scope(fullname: &str) -> Option<&str> {
    if !fullname.starts_with('@') {
        return None;
    }
    fullname.split_once('/').map(|(scope, _)| scope)
}
