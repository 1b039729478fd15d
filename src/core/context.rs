//! Request context management
//!
//! `Exchange` holds the per-request state handed to hooks and handlers. It is
//! owned by exactly one request execution and dropped once the response is
//! produced.

use std::{
    any::Any,
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use http::StatusCode;
use semver::Version;
use serde_json::Value;

use super::error::{RouteError, RouteResult};
use crate::hook::Stage;

/// Shared, process-wide values visible to every handler and hook
#[derive(Default)]
pub struct GlobalContext {
    vars: DashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl GlobalContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a typed value
    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.vars.insert(key.into(), Arc::new(value));
    }

    /// Get a typed value
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.vars
            .get(key)
            .and_then(|v| v.value().clone().downcast::<T>().ok())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }
}

/// Values scoped to a single request
#[derive(Default)]
pub struct LocalContext {
    vars: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl LocalContext {
    /// Store a typed value into the context
    pub fn set<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.vars.insert(key.into(), Box::new(value));
    }

    /// Get a typed reference from the context
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.vars.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    /// Get a string slice if the stored value is a `String`
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get::<String>(key).map(|s| s.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Box<dyn Any + Send + Sync>> {
        self.vars.remove(key)
    }
}

/// Request as the handler sees it, in its authored version's shape
#[derive(Debug, Clone, Default)]
pub struct HandlerRequest {
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}

impl HandlerRequest {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Response under construction
#[derive(Debug, Clone, Default)]
pub struct ResponseBuilder {
    status: Option<StatusCode>,
    headers: BTreeMap<String, String>,
    body: Option<Value>,
}

impl ResponseBuilder {
    pub fn status(&mut self, status: StatusCode) -> &mut Self {
        self.status = Some(status);
        self
    }

    pub fn header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn body(&mut self, body: Value) -> &mut Self {
        self.body = Some(body);
        self
    }

    pub fn get_status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn get_body(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn is_complete(&self) -> bool {
        self.status.is_some() && self.body.is_some()
    }

    pub(crate) fn take_body(&mut self) -> Option<Value> {
        self.body.take()
    }
}

/// Summary of the failure a catch hook is handling
#[derive(Debug, Clone)]
pub struct FailureInfo {
    pub stage: Stage,
    pub kind: &'static str,
    pub message: String,
}

impl FailureInfo {
    pub(crate) fn new(stage: Stage, error: &RouteError) -> Self {
        Self {
            stage,
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Per-request state threaded through every stage
pub struct Exchange {
    correlation_id: String,
    handler_id: String,
    resolved_version: Version,
    pub request: HandlerRequest,
    pub response: ResponseBuilder,
    pub local: LocalContext,
    global: Arc<GlobalContext>,
    failure: Option<FailureInfo>,
    deadline: Option<Instant>,
}

impl Exchange {
    pub fn new(
        correlation_id: impl Into<String>,
        handler_id: impl Into<String>,
        resolved_version: Version,
        request: HandlerRequest,
        global: Arc<GlobalContext>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            handler_id: handler_id.into(),
            resolved_version,
            request,
            response: ResponseBuilder::default(),
            local: LocalContext::default(),
            global,
            failure: None,
            deadline: None,
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn handler_id(&self) -> &str {
        &self.handler_id
    }

    /// Version the caller is served as
    pub fn resolved_version(&self) -> &Version {
        &self.resolved_version
    }

    pub fn global(&self) -> &GlobalContext {
        &self.global
    }

    /// Set while the catch chain runs
    pub fn failure(&self) -> Option<&FailureInfo> {
        self.failure.as_ref()
    }

    /// Deadline of the hook attempt currently running
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Budget left before the current hook attempt is cancelled
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub(crate) fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    pub(crate) fn set_failure(&mut self, failure: FailureInfo) {
        self.failure = Some(failure);
    }

    /// Borrow the pieces a handler receives.
    pub(crate) fn handler_parts(
        &mut self,
    ) -> (&HandlerRequest, &mut ResponseBuilder, &GlobalContext, &mut LocalContext) {
        (
            &self.request,
            &mut self.response,
            self.global.as_ref(),
            &mut self.local,
        )
    }

    /// Status and body, once the handler has populated both
    pub(crate) fn finished_response(&self) -> RouteResult<(StatusCode, &Value)> {
        match (self.response.get_status(), self.response.get_body()) {
            (Some(status), Some(body)) => Ok((status, body)),
            _ => Err(RouteError::Handler(
                "handler returned without populating status and body".to_string(),
            )),
        }
    }
}
