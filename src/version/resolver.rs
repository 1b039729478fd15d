use std::cmp::Ordering;

use log::debug;
use semver::Version;

use super::{
    graph::HandlerGraph,
    spec::{VersionSpec, LATEST},
};
use crate::core::{RouteError, RouteResult};

/// Outcome of resolving a specifier against one handler graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub handler_id: String,
    pub spec: VersionSpec,
    /// Version the request is served as
    pub version: Version,
    /// Best match before health was taken into account
    pub preferred: Version,
}

impl Resolution {
    /// Whether a healthier version replaced the best match
    pub fn substituted(&self) -> bool {
        self.version != self.preferred
    }
}

pub struct Resolver;

impl Resolver {
    /// Every version satisfying `spec`, best first.
    ///
    /// Ranked by `(major, minor, patch)` descending, then by most recent
    /// creation.
    pub fn candidates<'a>(graph: &'a HandlerGraph, spec: &VersionSpec) -> Vec<&'a Version> {
        let mut candidates: Vec<&Version> = match spec {
            VersionSpec::Alias(name) if name == LATEST => {
                graph.reachable_from_published().into_iter().collect()
            }
            VersionSpec::Alias(name) => graph.alias(name).into_iter().collect(),
            spec => graph.versions().filter(|v| spec.matches(v)).collect(),
        };
        candidates.sort_by(|a, b| Self::rank(graph, a, b));
        candidates
    }

    /// Best version satisfying `spec`.
    pub fn resolve(graph: &HandlerGraph, spec: &VersionSpec) -> RouteResult<Version> {
        Self::candidates(graph, spec)
            .first()
            .map(|v| (*v).clone())
            .ok_or_else(|| RouteError::VersionNotFound {
                handler_id: graph.handler_id().to_string(),
                spec: spec.to_string(),
            })
    }

    /// Resolve, preferring the best candidate that is not degraded.
    ///
    /// When every candidate is degraded the best match is served anyway.
    pub fn resolve_with_health<F>(
        graph: &HandlerGraph,
        spec: &VersionSpec,
        is_degraded: F,
    ) -> RouteResult<Resolution>
    where
        F: Fn(&Version) -> bool,
    {
        let candidates = Self::candidates(graph, spec);
        let Some(preferred) = candidates.first().map(|v| (*v).clone()) else {
            return Err(RouteError::VersionNotFound {
                handler_id: graph.handler_id().to_string(),
                spec: spec.to_string(),
            });
        };

        let version = candidates
            .iter()
            .find(|v| !is_degraded(v))
            .map_or_else(|| preferred.clone(), |v| (*v).clone());
        if version != preferred {
            debug!(
                "'{}' {preferred} is degraded, serving {version} for '{spec}'",
                graph.handler_id()
            );
        }

        Ok(Resolution {
            handler_id: graph.handler_id().to_string(),
            spec: spec.clone(),
            version,
            preferred,
        })
    }

    /// Whether a request resolved to `resolved` must be transformed to reach `authored`.
    pub fn needs_transform(resolved: &Version, authored: &Version) -> bool {
        resolved != authored
    }

    fn rank(graph: &HandlerGraph, a: &Version, b: &Version) -> Ordering {
        let created = |v: &Version| graph.node(v).map(|n| n.created_at);
        (b.major, b.minor, b.patch)
            .cmp(&(a.major, a.minor, a.patch))
            .then_with(|| created(b).cmp(&created(a)))
            .then_with(|| b.cmp(a))
    }
}
