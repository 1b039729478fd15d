use std::{fmt, str::FromStr};

use once_cell::sync::Lazy;
use regex::Regex;
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

use crate::core::RouteError;

/// Alias resolving to the highest version reachable from a published root
pub const LATEST: &str = "latest";

static ALIAS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9_-]*$").expect("alias pattern is valid")
});

/// What a caller asked for: an exact version, a semver range or a named alias.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum VersionSpec {
    Exact(Version),
    Range(VersionReq),
    Alias(String),
}

impl VersionSpec {
    pub fn latest() -> Self {
        VersionSpec::Alias(LATEST.to_string())
    }

    pub fn is_alias(&self) -> bool {
        matches!(self, VersionSpec::Alias(_))
    }

    /// Whether `version` satisfies an exact or range specifier. Aliases never match directly.
    pub fn matches(&self, version: &Version) -> bool {
        match self {
            VersionSpec::Exact(v) => v == version,
            VersionSpec::Range(req) => req.matches(version),
            VersionSpec::Alias(_) => false,
        }
    }
}

impl FromStr for VersionSpec {
    type Err = RouteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(RouteError::InvalidVersionSpec(
                "empty version specifier".to_string(),
            ));
        }

        let bare = s.strip_prefix('v').unwrap_or(s);
        if let Ok(version) = Version::parse(bare) {
            return Ok(VersionSpec::Exact(version));
        }
        if ALIAS_RE.is_match(s) {
            return Ok(VersionSpec::Alias(s.to_string()));
        }
        VersionReq::parse(s)
            .map(VersionSpec::Range)
            .map_err(|e| RouteError::InvalidVersionSpec(format!("'{s}': {e}")))
    }
}

impl TryFrom<String> for VersionSpec {
    type Error = RouteError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VersionSpec> for String {
    fn from(spec: VersionSpec) -> Self {
        spec.to_string()
    }
}

impl fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionSpec::Exact(v) => write!(f, "{v}"),
            VersionSpec::Range(req) => write!(f, "{req}"),
            VersionSpec::Alias(name) => f.write_str(name),
        }
    }
}
