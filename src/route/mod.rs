//! Request routing façade.
//!
//! `RouteManager::handle` resolves the requested version, plans the transform
//! chains between the resolved and the authored version, and hands the
//! exchange to the orchestrator. Outcomes feed the per-version health tracker
//! that steers later resolutions.

pub mod health;

#[cfg(test)]
mod tests;

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use dashmap::DashMap;
use http::StatusCode;
use log::{debug, info};
use semver::Version;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::{
    config::{build_hook_set, Config},
    core::{
        EventSink, Exchange, GlobalContext, Handler, HandlerRequest, RouteError, RouteResult,
        StructuredError,
    },
    hook::{HookDescriptor, HookSet, LifecycleEvent, Orchestrator, OrchestratorPlan, Scope},
    manifest::HandlerManifest,
    registry::Registry,
    transform::{TransformChain, TransformPlanner},
    version::{Resolver, VersionSpec},
};

pub use health::{HealthSnapshot, HealthTracker};

/// Request as supplied by Ingress
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestDescriptor {
    pub handler_id: String,
    /// Exact version, semver range or alias
    pub version_spec: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Value,
    #[serde(default = "RequestDescriptor::new_correlation_id")]
    pub correlation_id: String,
}

impl RequestDescriptor {
    /// New request with a freshly minted correlation id.
    pub fn new(handler_id: impl Into<String>, version_spec: impl Into<String>) -> Self {
        Self {
            handler_id: handler_id.into(),
            version_spec: version_spec.into(),
            headers: BTreeMap::new(),
            body: Value::Null,
            correlation_id: Self::new_correlation_id(),
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    fn new_correlation_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Successful response handed back to Ingress
#[derive(Debug, Clone, Serialize)]
pub struct ResponseDescriptor {
    pub correlation_id: String,
    pub handler_id: String,
    /// Version the caller was served as
    pub resolved_version: Version,
    /// Version the handler was written for
    pub authored_version: Version,
    #[serde(serialize_with = "serialize_status")]
    pub status: StatusCode,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
    pub events: Vec<LifecycleEvent>,
    /// Served by a healthier version than the best match
    pub substituted: bool,
}

fn serialize_status<S: Serializer>(status: &StatusCode, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u16(status.as_u16())
}

/// Per-request routing decision. Computed for every request, never cached.
#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    pub handler_id: String,
    pub resolved_version: Version,
    pub authored_version: Version,
    pub manifest: Arc<HandlerManifest>,
    pub request_chain: TransformChain,
    pub response_chain: TransformChain,
    /// A healthier version replaced the best match
    pub substituted: bool,
}

impl ResolvedRoute {
    pub fn needs_transform(&self) -> bool {
        Resolver::needs_transform(&self.resolved_version, &self.authored_version)
    }
}

/// A handler bound to the manifest version it was authored for
pub struct RouteBinding {
    handler_id: String,
    authored_version: Version,
    handler: Arc<dyn Handler>,
    route_hooks: Vec<HookDescriptor>,
    local_hooks: Vec<HookDescriptor>,
}

impl RouteBinding {
    pub fn new(
        handler_id: impl Into<String>,
        authored_version: Version,
        handler: Arc<dyn Handler>,
    ) -> Self {
        Self {
            handler_id: handler_id.into(),
            authored_version,
            handler,
            route_hooks: Vec::new(),
            local_hooks: Vec::new(),
        }
    }

    pub fn with_route_hook(mut self, mut descriptor: HookDescriptor) -> Self {
        descriptor.scope = Scope::Route;
        self.route_hooks.push(descriptor);
        self
    }

    pub fn with_local_hook(mut self, mut descriptor: HookDescriptor) -> Self {
        descriptor.scope = Scope::Local;
        self.local_hooks.push(descriptor);
        self
    }
}

struct BoundRoute {
    authored_version: Version,
    handler: Arc<dyn Handler>,
    route_hooks: Arc<HookSet>,
    local_hooks: Arc<HookSet>,
}

pub struct RouteManager {
    registry: Arc<Registry>,
    orchestrator: Orchestrator,
    health: HealthTracker,
    global: Arc<GlobalContext>,
    bindings: DashMap<String, Arc<BoundRoute>>,
    /// Route and local hooks declared in configuration, per handler
    configured_hooks: HashMap<String, (HookSet, HookSet)>,
}

impl RouteManager {
    pub fn new(registry: Arc<Registry>, orchestrator: Orchestrator, health: HealthTracker) -> Self {
        Self {
            registry,
            orchestrator,
            health,
            global: Arc::new(GlobalContext::new()),
            bindings: DashMap::new(),
            configured_hooks: HashMap::new(),
        }
    }

    /// Build a manager whose hooks and health settings come from `config`.
    ///
    /// The registry is expected to be initialised from the same config.
    pub fn from_config(
        config: &Config,
        registry: Arc<Registry>,
        sink: Arc<dyn EventSink>,
    ) -> RouteResult<Self> {
        let orchestrator = Orchestrator::new(config.global_hook_set()?, sink);
        let mut manager = Self::new(registry, orchestrator, HealthTracker::new(config.health.clone()));
        for handler in &config.handlers {
            let route = build_hook_set(&handler.hooks, Scope::Route, &config.orchestrator)?;
            let local = build_hook_set(&handler.local_hooks, Scope::Local, &config.orchestrator)?;
            manager
                .configured_hooks
                .insert(handler.id.clone(), (route, local));
        }
        Ok(manager)
    }

    /// Bind a handler. Replaces any previous binding of the same handler id.
    pub fn bind(&self, binding: RouteBinding) -> RouteResult<()> {
        // the authored version must be a registered manifest
        self.registry
            .manifest(&binding.handler_id, Some(&binding.authored_version))?;

        let (mut route_hooks, mut local_hooks) = self
            .configured_hooks
            .get(&binding.handler_id)
            .cloned()
            .unwrap_or_default();
        for descriptor in binding.route_hooks {
            route_hooks.push(descriptor);
        }
        for descriptor in binding.local_hooks {
            local_hooks.push(descriptor);
        }

        info!(
            "Bound '{}' authored at {} ({} route hook(s), {} local hook(s))",
            binding.handler_id,
            binding.authored_version,
            route_hooks.len(),
            local_hooks.len()
        );
        self.bindings.insert(
            binding.handler_id,
            Arc::new(BoundRoute {
                authored_version: binding.authored_version,
                handler: binding.handler,
                route_hooks: Arc::new(route_hooks),
                local_hooks: Arc::new(local_hooks),
            }),
        );
        Ok(())
    }

    pub fn unbind(&self, handler_id: &str) -> bool {
        self.bindings.remove(handler_id).is_some()
    }

    pub fn global(&self) -> &Arc<GlobalContext> {
        &self.global
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Resolve a request to a concrete version and its transform chains.
    pub fn resolve(&self, request: &RequestDescriptor) -> RouteResult<ResolvedRoute> {
        let spec: VersionSpec = request.version_spec.parse()?;
        let handler_id = request.handler_id.as_str();
        let bound = self.binding(handler_id)?;
        let graph = self.registry.graph(handler_id)?;

        let resolution = Resolver::resolve_with_health(&graph, &spec, |v| {
            self.health.is_degraded(handler_id, v)
        })?;

        let (version, plan) =
            match TransformPlanner::plan(&graph, &resolution.version, &bound.authored_version) {
                Ok(plan) => (resolution.version.clone(), plan),
                // a substitute the handler cannot be adapted to is no alternative
                Err(_) if resolution.substituted() => (
                    resolution.preferred.clone(),
                    TransformPlanner::plan(&graph, &resolution.preferred, &bound.authored_version)?,
                ),
                Err(e) => return Err(e),
            };

        let manifest = self.registry.manifest(handler_id, Some(&version))?;
        debug!(
            "[{}] '{handler_id}' {spec} resolved to {version} (authored {}), transformers {:?}",
            request.correlation_id,
            bound.authored_version,
            plan.transformer_ids()
        );

        Ok(ResolvedRoute {
            handler_id: handler_id.to_string(),
            substituted: version != resolution.preferred,
            resolved_version: version,
            authored_version: bound.authored_version.clone(),
            manifest,
            request_chain: TransformChain::for_requests(&plan),
            response_chain: TransformChain::for_responses(&plan),
        })
    }

    /// Serve one request end to end.
    pub async fn handle(
        &self,
        request: RequestDescriptor,
    ) -> Result<ResponseDescriptor, StructuredError> {
        let correlation_id = request.correlation_id.clone();
        let route = self
            .resolve(&request)
            .map_err(|e| StructuredError::early(&correlation_id, e))?;
        let bound = self
            .binding(&route.handler_id)
            .map_err(|e| StructuredError::early(&correlation_id, e))?;

        let plan = OrchestratorPlan {
            manifest: route.manifest.clone(),
            request_chain: route.request_chain.clone(),
            response_chain: route.response_chain.clone(),
            handler: bound.handler.clone(),
            route_hooks: bound.route_hooks.clone(),
            local_hooks: bound.local_hooks.clone(),
        };
        let exchange = Exchange::new(
            request.correlation_id,
            route.handler_id.clone(),
            route.resolved_version.clone(),
            HandlerRequest {
                headers: request.headers,
                body: request.body,
            },
            self.global.clone(),
        );

        match self.orchestrator.run(&plan, exchange).await {
            Ok(done) => {
                self.health
                    .record(&route.handler_id, &route.resolved_version, true);
                Ok(ResponseDescriptor {
                    correlation_id,
                    handler_id: route.handler_id,
                    resolved_version: route.resolved_version,
                    authored_version: route.authored_version,
                    status: done.status,
                    headers: done.headers,
                    body: done.body,
                    events: done.events,
                    substituted: route.substituted,
                })
            }
            Err(err) => {
                if !err.is_client_fault() {
                    self.health
                        .record(&route.handler_id, &route.resolved_version, false);
                }
                Err(err)
            }
        }
    }

    fn binding(&self, handler_id: &str) -> RouteResult<Arc<BoundRoute>> {
        self.bindings
            .get(handler_id)
            .map(|b| b.value().clone())
            .ok_or_else(|| RouteError::UnknownHandler(handler_id.to_string()))
    }
}
