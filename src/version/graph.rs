//! Per-handler version graphs and their snapshot store.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    fmt,
    sync::{Arc, Mutex},
};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use log::debug;
use semver::Version;

use super::spec::LATEST;
use crate::{
    core::{ErrorContext, RouteError, RouteResult, Transformer},
    transform::Direction,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionNode {
    pub created_at: DateTime<Utc>,
    /// Published versions are the roots `latest` is computed from
    pub published: bool,
}

type TransformerKey = (Version, Version, Direction);

/// Versions of one handler and the compatibility edges between them.
///
/// Edges are directed and the graph is kept acyclic. Transformers hang off
/// edges and may run in either orientation of the edge they belong to.
#[derive(Clone)]
pub struct HandlerGraph {
    handler_id: String,
    nodes: BTreeMap<Version, VersionNode>,
    edges: BTreeMap<Version, BTreeSet<Version>>,
    aliases: BTreeMap<String, Version>,
    transformers: HashMap<TransformerKey, Arc<dyn Transformer>>,
}

impl HandlerGraph {
    pub fn new(handler_id: impl Into<String>) -> Self {
        Self {
            handler_id: handler_id.into(),
            nodes: BTreeMap::new(),
            edges: BTreeMap::new(),
            aliases: BTreeMap::new(),
            transformers: HashMap::new(),
        }
    }

    pub fn handler_id(&self) -> &str {
        &self.handler_id
    }

    /// Add a version node. Re-adding a known version can only publish it.
    pub fn add_version(&mut self, version: Version, created_at: DateTime<Utc>, published: bool) {
        self.nodes
            .entry(version)
            .and_modify(|node| node.published |= published)
            .or_insert(VersionNode {
                created_at,
                published,
            });
    }

    pub fn publish(&mut self, version: &Version) -> RouteResult<()> {
        let node = self
            .nodes
            .get_mut(version)
            .ok_or_else(|| not_found(&self.handler_id, version))?;
        node.published = true;
        Ok(())
    }

    /// Add the directed edge `from -> to`, rejecting edges that would close a cycle.
    pub fn add_edge(&mut self, from: Version, to: Version) -> RouteResult<()> {
        for v in [&from, &to] {
            if !self.contains(v) {
                return Err(not_found(&self.handler_id, v));
            }
        }
        if from == to || self.reaches(&to, &from) {
            return Err(RouteError::CyclicGraph {
                handler_id: self.handler_id.clone(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        self.edges.entry(from).or_default().insert(to);
        Ok(())
    }

    pub fn add_transformer(&mut self, transformer: Arc<dyn Transformer>) -> RouteResult<()> {
        let spec = transformer.spec();
        if spec.handler_id != self.handler_id {
            return Err(RouteError::Configuration(format!(
                "Transformer '{}' belongs to '{}', not '{}'",
                spec.id, spec.handler_id, self.handler_id
            )));
        }
        if !self.has_edge(&spec.from, &spec.to) && !self.has_edge(&spec.to, &spec.from) {
            return Err(RouteError::Configuration(format!(
                "Transformer '{}' spans {} and {}, which share no edge",
                spec.id, spec.from, spec.to
            )));
        }

        let key = (spec.from.clone(), spec.to.clone(), spec.direction);
        if let Some(existing) = self.transformers.get(&key) {
            return Err(RouteError::Configuration(format!(
                "Transformer '{}' conflicts with '{}' for {} {} -> {}",
                spec.id,
                existing.id(),
                spec.direction,
                spec.from,
                spec.to
            )));
        }
        self.transformers.insert(key, transformer);
        Ok(())
    }

    /// Point a named alias at a version. `latest` is computed and cannot be set.
    pub fn set_alias(&mut self, name: impl Into<String>, version: Version) -> RouteResult<()> {
        let name = name.into();
        if name == LATEST {
            return Err(RouteError::Configuration(format!(
                "Alias '{LATEST}' is reserved for '{}'",
                self.handler_id
            )));
        }
        if !self.contains(&version) {
            return Err(not_found(&self.handler_id, &version));
        }
        self.aliases.insert(name, version);
        Ok(())
    }

    pub fn contains(&self, version: &Version) -> bool {
        self.nodes.contains_key(version)
    }

    pub fn node(&self, version: &Version) -> Option<&VersionNode> {
        self.nodes.get(version)
    }

    pub fn versions(&self) -> impl Iterator<Item = &Version> {
        self.nodes.keys()
    }

    pub fn alias(&self, name: &str) -> Option<&Version> {
        self.aliases.get(name)
    }

    pub fn aliases(&self) -> &BTreeMap<String, Version> {
        &self.aliases
    }

    pub fn has_edge(&self, from: &Version, to: &Version) -> bool {
        self.edges.get(from).is_some_and(|out| out.contains(to))
    }

    /// Versions one edge away in either orientation, in ascending order.
    pub fn neighbors(&self, version: &Version) -> BTreeSet<&Version> {
        let outgoing = self.edges.get(version).into_iter().flatten();
        let incoming = self
            .edges
            .iter()
            .filter(|(_, out)| out.contains(version))
            .map(|(from, _)| from);
        outgoing.chain(incoming).collect()
    }

    pub fn transformer(
        &self,
        from: &Version,
        to: &Version,
        direction: Direction,
    ) -> Option<&Arc<dyn Transformer>> {
        self.transformers
            .get(&(from.clone(), to.clone(), direction))
    }

    /// Whether a directed path leads from `from` to `to`.
    pub fn reaches(&self, from: &Version, to: &Version) -> bool {
        self.reachable([from]).contains(to)
    }

    /// Versions reachable along directed edges from any published root.
    pub fn reachable_from_published(&self) -> BTreeSet<&Version> {
        self.reachable(
            self.nodes
                .iter()
                .filter(|(_, node)| node.published)
                .map(|(v, _)| v),
        )
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(BTreeSet::len).sum()
    }

    pub fn transformer_count(&self) -> usize {
        self.transformers.len()
    }

    pub fn version_count(&self) -> usize {
        self.nodes.len()
    }

    fn reachable<'a>(&'a self, roots: impl IntoIterator<Item = &'a Version>) -> BTreeSet<&'a Version> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&Version> = roots.into_iter().collect();
        while let Some(version) = queue.pop_front() {
            let Some((version, _)) = self.nodes.get_key_value(version) else {
                continue;
            };
            if seen.insert(version) {
                queue.extend(self.edges.get(version).into_iter().flatten());
            }
        }
        seen
    }
}

impl fmt::Debug for HandlerGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerGraph")
            .field("handler_id", &self.handler_id)
            .field("versions", &self.nodes.len())
            .field("edges", &self.edge_count())
            .field("aliases", &self.aliases)
            .field("transformers", &self.transformers.len())
            .finish()
    }
}

fn not_found(handler_id: &str, version: &Version) -> RouteError {
    RouteError::VersionNotFound {
        handler_id: handler_id.to_string(),
        spec: version.to_string(),
    }
}

type GraphIndex = HashMap<String, Arc<HandlerGraph>>;

/// Snapshot store of every handler graph.
///
/// Readers load the current snapshot without locking. Writers serialize on a
/// mutex, edit a private copy of one graph and publish it with a single swap,
/// so a failed edit leaves the published graph untouched.
pub struct GraphStore {
    snapshot: ArcSwap<GraphIndex>,
    write_lock: Mutex<()>,
}

impl Default for GraphStore {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphStore {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(GraphIndex::new()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn get(&self, handler_id: &str) -> Option<Arc<HandlerGraph>> {
        self.snapshot.load().get(handler_id).cloned()
    }

    /// Apply `edit` to a copy of the handler's graph and publish the result.
    pub fn update<F>(&self, handler_id: &str, edit: F) -> RouteResult<Arc<HandlerGraph>>
    where
        F: FnOnce(&mut HandlerGraph) -> RouteResult<()>,
    {
        let _guard = self
            .write_lock
            .lock()
            .with_context("graph store lock")?;

        let current = self.snapshot.load_full();
        let mut graph = current
            .get(handler_id)
            .map(|g| g.as_ref().clone())
            .unwrap_or_else(|| HandlerGraph::new(handler_id));
        edit(&mut graph)?;

        let graph = Arc::new(graph);
        let mut next = current.as_ref().clone();
        next.insert(handler_id.to_string(), graph.clone());
        self.snapshot.store(Arc::new(next));
        debug!("Published graph snapshot for '{handler_id}': {graph:?}");
        Ok(graph)
    }

    pub fn handler_ids(&self) -> Vec<String> {
        self.snapshot.load().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release every published graph.
    pub fn clear(&self) {
        self.snapshot.store(Arc::new(GraphIndex::new()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn chain() -> HandlerGraph {
        let mut graph = HandlerGraph::new("getUser");
        for version in ["1.0.0", "1.1.0", "2.0.0"] {
            graph.add_version(v(version), Utc::now(), false);
        }
        graph.add_edge(v("1.0.0"), v("1.1.0")).unwrap();
        graph.add_edge(v("1.1.0"), v("2.0.0")).unwrap();
        graph
    }

    #[test]
    fn test_cycles_are_rejected() {
        let mut graph = chain();
        assert!(matches!(
            graph.add_edge(v("2.0.0"), v("1.0.0")),
            Err(RouteError::CyclicGraph { .. })
        ));
        assert!(matches!(
            graph.add_edge(v("1.1.0"), v("1.1.0")),
            Err(RouteError::CyclicGraph { .. })
        ));
        assert_eq!(graph.edge_count(), 2);
        // a shortcut in the same direction is fine
        graph.add_edge(v("1.0.0"), v("2.0.0")).unwrap();
    }

    #[test]
    fn test_edges_need_known_versions() {
        let mut graph = chain();
        assert!(matches!(
            graph.add_edge(v("1.0.0"), v("3.0.0")),
            Err(RouteError::VersionNotFound { .. })
        ));
    }

    #[test]
    fn test_reachability_from_published_roots() {
        let mut graph = chain();
        graph.add_version(v("0.9.0"), Utc::now(), false);
        assert!(graph.reachable_from_published().is_empty());

        graph.publish(&v("1.1.0")).unwrap();
        let reachable: Vec<String> = graph
            .reachable_from_published()
            .into_iter()
            .map(Version::to_string)
            .collect();
        assert_eq!(reachable, vec!["1.1.0", "2.0.0"]);
    }

    #[test]
    fn test_neighbors_are_undirected() {
        let graph = chain();
        let neighbors: Vec<&Version> = graph.neighbors(&v("1.1.0")).into_iter().collect();
        assert_eq!(neighbors, vec![&v("1.0.0"), &v("2.0.0")]);
    }

    #[test]
    fn test_latest_alias_is_reserved() {
        let mut graph = chain();
        assert!(graph.set_alias("latest", v("1.0.0")).is_err());
        graph.set_alias("stable", v("1.1.0")).unwrap();
        assert_eq!(graph.alias("stable"), Some(&v("1.1.0")));
        assert!(graph.set_alias("beta", v("9.0.0")).is_err());
    }

    #[test]
    fn test_store_update_is_copy_on_write() {
        let store = GraphStore::new();
        store
            .update("getUser", |g| {
                g.add_version(v("1.0.0"), Utc::now(), true);
                Ok(())
            })
            .unwrap();
        let before = store.get("getUser").unwrap();

        // failed edits publish nothing
        let err = store.update("getUser", |g| {
            g.add_version(v("2.0.0"), Utc::now(), false);
            g.add_edge(v("2.0.0"), v("2.0.0"))
        });
        assert!(err.is_err());
        assert_eq!(store.get("getUser").unwrap().version_count(), 1);

        store
            .update("getUser", |g| {
                g.add_version(v("2.0.0"), Utc::now(), false);
                g.add_edge(v("1.0.0"), v("2.0.0"))
            })
            .unwrap();
        assert_eq!(before.version_count(), 1);
        assert_eq!(store.get("getUser").unwrap().version_count(), 2);

        store.clear();
        assert!(store.is_empty());
    }
}
