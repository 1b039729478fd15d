//! Unified error handling for timescape
//!
//! This module provides the error taxonomy shared by every component, and the
//! structured error surfaced to Ingress once a request has failed.

use std::fmt;

use http::StatusCode;
use serde::Serialize;

use crate::{
    hook::{LifecycleEvent, Outcome, Stage},
    schema::Violation,
};

/// Which payload a validation error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadSide {
    Request,
    Response,
}

impl fmt::Display for PayloadSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadSide::Request => f.write_str("request"),
            PayloadSide::Response => f.write_str("response"),
        }
    }
}

/// Unified error types for routing, registration and orchestration
#[derive(Debug)]
pub enum RouteError {
    /// No version of the handler satisfies the requested specifier
    VersionNotFound { handler_id: String, spec: String },

    /// The two versions live in disconnected parts of the version graph
    NoTransformPath {
        handler_id: String,
        from: String,
        to: String,
    },

    /// A transformer rejected its input
    Transformer { transformer_id: String, message: String },

    /// Payload failed schema validation; carries every violation found
    Validation {
        side: PayloadSide,
        violations: Vec<Violation>,
    },

    /// A hook did not finish within its budget
    HookTimeout { hook: String, timeout_ms: u64 },

    /// A hook returned an error
    HookFailure { hook: String, message: String },

    /// Business logic failed
    Handler(String),

    /// A catch hook itself failed
    CatchChain { hook: String, message: String },

    /// `(handler_id, version)` is already registered
    DuplicateVersion { handler_id: String, version: String },

    /// Adding the edge would introduce a cycle
    CyclicGraph {
        handler_id: String,
        from: String,
        to: String,
    },

    /// No handler, manifest or binding under that id
    UnknownHandler(String),

    /// The version specifier could not be parsed
    InvalidVersionSpec(String),

    /// Configuration-related errors
    Configuration(String),

    /// Manifest backend errors
    Storage(std::io::Error),

    /// Encoding or decoding errors
    Serialization(String),

    /// Internal system errors
    Internal(String),
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteError::VersionNotFound { handler_id, spec } => {
                write!(f, "No version of '{handler_id}' satisfies '{spec}'")
            }
            RouteError::NoTransformPath {
                handler_id,
                from,
                to,
            } => write!(
                f,
                "No transform path for '{handler_id}' between {from} and {to}"
            ),
            RouteError::Transformer {
                transformer_id,
                message,
            } => write!(f, "Transformer '{transformer_id}' failed: {message}"),
            RouteError::Validation { side, violations } => {
                write!(f, "Invalid {side} payload: {} violation(s)", violations.len())?;
                for v in violations.iter().take(3) {
                    write!(f, "; {v}")?;
                }
                Ok(())
            }
            RouteError::HookTimeout { hook, timeout_ms } => {
                write!(f, "Hook '{hook}' timed out after {timeout_ms}ms")
            }
            RouteError::HookFailure { hook, message } => {
                write!(f, "Hook '{hook}' failed: {message}")
            }
            RouteError::Handler(msg) => write!(f, "Handler error: {msg}"),
            RouteError::CatchChain { hook, message } => {
                write!(f, "Catch hook '{hook}' failed: {message}")
            }
            RouteError::DuplicateVersion {
                handler_id,
                version,
            } => write!(f, "Manifest '{handler_id}' {version} already exists"),
            RouteError::CyclicGraph {
                handler_id,
                from,
                to,
            } => write!(
                f,
                "Edge {from} -> {to} would create a cycle in the graph of '{handler_id}'"
            ),
            RouteError::UnknownHandler(id) => write!(f, "Unknown handler: {id}"),
            RouteError::InvalidVersionSpec(msg) => write!(f, "Invalid version spec: {msg}"),
            RouteError::Configuration(msg) => write!(f, "Configuration error: {msg}"),
            RouteError::Storage(err) => write!(f, "Storage error: {err}"),
            RouteError::Serialization(msg) => write!(f, "Serialization error: {msg}"),
            RouteError::Internal(msg) => write!(f, "Internal error: {msg}"),
        }
    }
}

impl std::error::Error for RouteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RouteError::Storage(err) => Some(err),
            _ => None,
        }
    }
}

impl RouteError {
    /// Failures caused by the request itself rather than the service.
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            RouteError::VersionNotFound { .. }
                | RouteError::NoTransformPath { .. }
                | RouteError::InvalidVersionSpec(_)
                | RouteError::Validation {
                    side: PayloadSide::Request,
                    ..
                }
        )
    }

    /// Whether an idempotent hook may be attempted again after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RouteError::HookTimeout { .. })
    }

    /// Lifecycle outcome recorded for a stage that failed with this error.
    pub fn outcome(&self) -> Outcome {
        match self {
            RouteError::HookTimeout { .. } => Outcome::Timeout,
            _ => Outcome::Error,
        }
    }

    /// Short machine-readable name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            RouteError::VersionNotFound { .. } => "VersionNotFound",
            RouteError::NoTransformPath { .. } => "NoTransformPath",
            RouteError::Transformer { .. } => "TransformerError",
            RouteError::Validation { .. } => "ValidationError",
            RouteError::HookTimeout { .. } => "HookTimeout",
            RouteError::HookFailure { .. } => "HookFailure",
            RouteError::Handler(_) => "HandlerError",
            RouteError::CatchChain { .. } => "CatchChainError",
            RouteError::DuplicateVersion { .. } => "DuplicateVersion",
            RouteError::CyclicGraph { .. } => "CyclicGraph",
            RouteError::UnknownHandler(_) => "UnknownHandler",
            RouteError::InvalidVersionSpec(_) => "InvalidVersionSpec",
            RouteError::Configuration(_) => "Configuration",
            RouteError::Storage(_) => "Storage",
            RouteError::Serialization(_) => "Serialization",
            RouteError::Internal(_) => "Internal",
        }
    }

    /// Create a serialization error with context
    pub fn serialization_error(context: &str, err: impl fmt::Display) -> Self {
        RouteError::Serialization(format!("{context}: {err}"))
    }
}

// Error conversions
impl From<std::io::Error> for RouteError {
    fn from(err: std::io::Error) -> Self {
        RouteError::Storage(err)
    }
}

impl From<serde_json::Error> for RouteError {
    fn from(err: serde_json::Error) -> Self {
        RouteError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for RouteError {
    fn from(err: serde_yaml::Error) -> Self {
        RouteError::Serialization(err.to_string())
    }
}

impl From<semver::Error> for RouteError {
    fn from(err: semver::Error) -> Self {
        RouteError::InvalidVersionSpec(err.to_string())
    }
}

impl From<validator::ValidationErrors> for RouteError {
    fn from(err: validator::ValidationErrors) -> Self {
        RouteError::Configuration(err.to_string())
    }
}

/// Result type alias for routing operations
pub type RouteResult<T> = std::result::Result<T, RouteError>;

/// Helper trait for adding context to errors
pub trait ErrorContext<T> {
    fn with_context(self, context: &str) -> RouteResult<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: fmt::Display,
{
    fn with_context(self, context: &str) -> RouteResult<T> {
        self.map_err(|e| RouteError::Internal(format!("{context}: {e}")))
    }
}

/// Shorthand for `RouteError::Configuration`
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::core::RouteError::Configuration($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::core::RouteError::Configuration(format!($fmt, $($arg)*))
    };
}

/// One catch hook execution, recorded for the surfaced error.
#[derive(Debug, Clone, Serialize)]
pub struct CatchRecord {
    pub hook: String,
    pub stage: Stage,
    pub outcome: Outcome,
    /// Rendered `CatchChainError`, if the hook failed
    pub error: Option<String>,
}

/// Error surfaced by the route manager.
///
/// Carries enough to reconstruct the failure from the response alone: the
/// correlation id, which stage failed, every lifecycle event recorded and the
/// outcome of each catch hook.
#[derive(Debug)]
pub struct StructuredError {
    pub correlation_id: String,
    pub error: RouteError,
    pub failed_stage: Option<Stage>,
    pub events: Vec<LifecycleEvent>,
    pub catch_log: Vec<CatchRecord>,
}

impl StructuredError {
    /// Error raised before the orchestrator ran any stage.
    pub fn early(correlation_id: impl Into<String>, error: RouteError) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            error,
            failed_stage: None,
            events: Vec::new(),
            catch_log: Vec::new(),
        }
    }

    pub fn is_client_fault(&self) -> bool {
        self.error.is_client_fault()
    }

    /// Catch hooks that failed while handling this error.
    pub fn catch_failures(&self) -> impl Iterator<Item = &CatchRecord> {
        self.catch_log.iter().filter(|r| r.outcome != Outcome::Ok)
    }

    /// HTTP status Ingress should answer with.
    pub fn status(&self) -> StatusCode {
        match &self.error {
            RouteError::VersionNotFound { .. } | RouteError::UnknownHandler(_) => {
                StatusCode::NOT_FOUND
            }
            RouteError::InvalidVersionSpec(_) => StatusCode::BAD_REQUEST,
            RouteError::NoTransformPath { .. }
            | RouteError::Validation {
                side: PayloadSide::Request,
                ..
            } => StatusCode::UNPROCESSABLE_ENTITY,
            RouteError::HookTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// JSON body describing the failure.
    pub fn to_json(&self) -> serde_json::Value {
        let violations = match &self.error {
            RouteError::Validation { violations, .. } => {
                serde_json::to_value(violations).unwrap_or_default()
            }
            _ => serde_json::Value::Null,
        };
        serde_json::json!({
            "correlation_id": self.correlation_id,
            "kind": self.error.kind(),
            "message": self.error.to_string(),
            "failed_stage": self.failed_stage,
            "violations": violations,
            "catch_log": self.catch_log,
        })
    }
}

impl fmt::Display for StructuredError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] ", self.correlation_id)?;
        if let Some(stage) = self.failed_stage {
            write!(f, "{stage}: ")?;
        }
        write!(f, "{}", self.error)?;
        let failed = self.catch_failures().count();
        if failed > 0 {
            write!(f, " ({failed} catch hook(s) failed)")?;
        }
        Ok(())
    }
}

impl std::error::Error for StructuredError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
