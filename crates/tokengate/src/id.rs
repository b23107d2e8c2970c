//! Request identifiers.

use serde::{Deserialize, Serialize};

/// Caller-facing identifier for one admission request.
///
/// Identifiers are labels for diagnostics and job tagging. They do not need to
/// be unique: the limiter tracks every `acquire` call by its own ticket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Full v4 UUID.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Last four hex digits of a v4 UUID, for tagging short-lived jobs.
    pub fn short() -> Self {
        let simple = uuid::Uuid::new_v4().simple().to_string();
        Self(simple[simple.len() - 4..].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::generate()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        Self(id)
    }
}
