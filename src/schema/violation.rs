use std::fmt;

use serde::{Deserialize, Serialize};

/// A single schema violation.
///
/// `path` uses dotted field names with `[n]` array indexes (`user.tags[2]`);
/// the payload root is the empty path and renders as `$`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub path: String,
    pub expected: String,
    pub actual: String,
    /// Per-variant failures when a union matched nothing
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<Violation>,
}

impl Violation {
    pub fn new(path: &str, expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            expected: expected.into(),
            actual: actual.into(),
            causes: Vec::new(),
        }
    }

    pub fn with_causes(mut self, causes: Vec<Violation>) -> Self {
        self.causes = causes;
        self
    }

    pub fn display_path(&self) -> &str {
        if self.path.is_empty() {
            "$"
        } else {
            &self.path
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: expected {}, got {}",
            self.display_path(),
            self.expected,
            self.actual
        )
    }
}
