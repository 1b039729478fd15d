//! Core traits for timescape components
//!
//! These are the seams where the engine meets code it does not own: storage,
//! observability, business handlers, lifecycle hooks and payload transformers.

use async_trait::async_trait;
use serde_json::Value;

use super::{
    context::{Exchange, GlobalContext, HandlerRequest, LocalContext, ResponseBuilder},
    error::RouteResult,
};
use crate::{
    hook::{HookError, LifecycleEvent},
    manifest::HandlerManifest,
    transform::TransformerSpec,
};

/// Boxed error returned by business handlers
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Persistence behind the manifest store
pub trait ManifestBackend: Send + Sync {
    /// Durably record a new manifest
    fn persist(&self, manifest: &HandlerManifest) -> RouteResult<()>;

    /// Every manifest previously persisted
    fn load(&self) -> RouteResult<Vec<HandlerManifest>>;
}

/// Destination of the lifecycle event stream
///
/// Failures are logged by the caller and never abort a request.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &LifecycleEvent) -> RouteResult<()>;
}

/// Business logic bound to one authored manifest version
#[async_trait]
pub trait Handler: Send + Sync {
    /// Serve a request. Must populate both status and body on `response`.
    async fn handle(
        &self,
        request: &HandlerRequest,
        response: &mut ResponseBuilder,
        global: &GlobalContext,
        local: &mut LocalContext,
    ) -> Result<(), BoxError>;
}

/// A lifecycle hook.
///
/// The future returned by `call` is dropped when the hook's timeout expires, so
/// a hook must not rely on running to completion. [`Exchange::remaining`]
/// exposes the budget left for the current attempt.
#[async_trait]
pub trait Hook: Send + Sync {
    /// Return the name of this hook
    fn name(&self) -> &str;

    async fn call(&self, exchange: &mut Exchange) -> Result<(), HookError>;
}

/// Pure payload adapter between two versions of a handler
pub trait Transformer: Send + Sync {
    fn spec(&self) -> &TransformerSpec;

    /// Deterministic and side-effect free; fails outside its declared domain
    fn apply(&self, payload: Value) -> RouteResult<Value>;

    fn id(&self) -> &str {
        &self.spec().id
    }
}
