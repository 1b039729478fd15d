//! Payload transformers between handler versions.

pub mod builtin;
pub mod chain;
pub mod planner;

use std::fmt;

use semver::Version;
use serde::{Deserialize, Serialize};

pub use builtin::{build_transformer, inverse_config, FnTransformer};
pub use chain::TransformChain;
pub use planner::{PlanStep, TransformPlan, TransformPlanner};

/// Which payload a transformer adapts
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Request,
    Response,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Request => f.write_str("request"),
            Direction::Response => f.write_str("response"),
        }
    }
}

/// Identity of a transformer: converts `direction` payloads shaped as `from` into `to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformerSpec {
    pub id: String,
    pub handler_id: String,
    pub from: Version,
    pub to: Version,
    pub direction: Direction,
}

impl TransformerSpec {
    pub fn new(
        id: impl Into<String>,
        handler_id: impl Into<String>,
        from: Version,
        to: Version,
        direction: Direction,
    ) -> Self {
        Self {
            id: id.into(),
            handler_id: handler_id.into(),
            from,
            to,
            direction,
        }
    }
}
