//! Registry service owning the manifest store and the version graphs.
//!
//! Registration writes go through here so that every stored manifest also
//! becomes a node of its handler's graph. Request handling only reads.

use std::sync::Arc;

use log::{debug, info};
use semver::Version;

use crate::{
    config::{Config, HandlerConfig, TransformerConfig},
    core::{ManifestBackend, RouteError, RouteResult, Transformer},
    manifest::{HandlerManifest, ManifestStore, MemoryBackend},
    transform::{build_transformer, inverse_config, Direction, TransformerSpec},
    version::{GraphStore, HandlerGraph},
};

/// Statistics about registry contents
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub handler_count: usize,
    pub manifest_count: usize,
    pub edge_count: usize,
    pub transformer_count: usize,
    pub alias_count: usize,
}

pub struct Registry {
    manifests: ManifestStore,
    graphs: GraphStore,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(Arc::new(MemoryBackend::default()))
    }
}

impl Registry {
    pub fn new(backend: Arc<dyn ManifestBackend>) -> Self {
        Self {
            manifests: ManifestStore::new(backend),
            graphs: GraphStore::new(),
        }
    }

    /// Load the backend, then register everything `config` declares.
    ///
    /// Running it again with the same config is a no-op; a transformer id
    /// that changed for an already registered slot is a conflict.
    ///
    /// Fails on invalid manifests, references to unknown versions and cyclic
    /// graphs. Manifests already present in the backend are kept as stored.
    pub fn init(&self, config: &Config) -> RouteResult<RegistryStats> {
        use validator::Validate;
        config.validate()?;

        let hydrated = self.manifests.hydrate()?;
        for handler_id in self.manifests.handler_ids() {
            let handler = config.handler(&handler_id);
            let manifests = self.manifests.list_versions(&handler_id);
            self.graphs.update(&handler_id, |graph| {
                for manifest in &manifests {
                    let published = handler.map_or(true, |h| h.is_published(&manifest.version));
                    graph.add_version(manifest.version.clone(), manifest.created_at, published);
                }
                Ok(())
            })?;
        }

        for handler in &config.handlers {
            self.init_handler(handler)?;
        }

        let stats = self.stats();
        info!(
            "Registry initialised: {} handler(s), {} manifest(s) ({hydrated} from backend), {} edge(s), {} transformer(s)",
            stats.handler_count, stats.manifest_count, stats.edge_count, stats.transformer_count
        );
        Ok(stats)
    }

    fn init_handler(&self, handler: &HandlerConfig) -> RouteResult<()> {
        for manifest in &handler.manifests {
            if self.manifests.contains(&handler.id, &manifest.version) {
                debug!(
                    "Manifest '{}' {} already registered, keeping stored copy",
                    handler.id, manifest.version
                );
                continue;
            }
            self.register_manifest(
                manifest.to_manifest(&handler.id),
                handler.is_published(&manifest.version),
            )?;
        }

        let transformers = handler
            .transformers
            .iter()
            .map(|t| Self::build_transformers(&handler.id, t))
            .collect::<RouteResult<Vec<_>>>()?;

        // one snapshot swap for the whole handler
        self.graphs.update(&handler.id, |graph| {
            for edge in &handler.edges {
                if !graph.has_edge(&edge.from, &edge.to) {
                    graph.add_edge(edge.from.clone(), edge.to.clone())?;
                }
            }
            for (name, version) in &handler.aliases {
                graph.set_alias(name.clone(), version.clone())?;
            }
            for transformer in transformers.into_iter().flatten() {
                let spec = transformer.spec();
                let registered = graph
                    .transformer(&spec.from, &spec.to, spec.direction)
                    .is_some_and(|existing| existing.id() == spec.id);
                if !registered {
                    graph.add_transformer(transformer)?;
                }
            }
            Ok(())
        })?;
        Ok(())
    }

    fn build_transformers(
        handler_id: &str,
        config: &TransformerConfig,
    ) -> RouteResult<Vec<Arc<dyn Transformer>>> {
        let spec = TransformerSpec::new(
            config.id.clone(),
            handler_id,
            config.from.clone(),
            config.to.clone(),
            config.direction,
        );
        let mut built = vec![build_transformer(&config.kind, spec, config.config.clone())?];

        if config.inverse {
            let (kind, cfg) = inverse_config(&config.kind, &config.config)?.ok_or_else(|| {
                RouteError::Configuration(format!(
                    "Transformer '{}' of kind '{}' has no inverse",
                    config.id, config.kind
                ))
            })?;
            let direction = match config.direction {
                Direction::Request => Direction::Response,
                Direction::Response => Direction::Request,
            };
            let spec = TransformerSpec::new(
                format!("{}-inverse", config.id),
                handler_id,
                config.to.clone(),
                config.from.clone(),
                direction,
            );
            built.push(build_transformer(kind, spec, cfg)?);
        }
        Ok(built)
    }

    /// Store a manifest and add its version to the handler's graph.
    pub fn register_manifest(
        &self,
        manifest: HandlerManifest,
        published: bool,
    ) -> RouteResult<Arc<HandlerManifest>> {
        let stored = self.manifests.store(manifest)?;
        self.graphs.update(&stored.handler_id, |graph| {
            graph.add_version(stored.version.clone(), stored.created_at, published);
            Ok(())
        })?;
        Ok(stored)
    }

    pub fn add_edge(&self, handler_id: &str, from: Version, to: Version) -> RouteResult<()> {
        self.existing_graph(handler_id)?;
        self.graphs
            .update(handler_id, |graph| graph.add_edge(from, to))?;
        Ok(())
    }

    pub fn add_transformer(&self, transformer: Arc<dyn Transformer>) -> RouteResult<()> {
        let handler_id = transformer.spec().handler_id.clone();
        self.existing_graph(&handler_id)?;
        self.graphs
            .update(&handler_id, |graph| graph.add_transformer(transformer))?;
        Ok(())
    }

    pub fn set_alias(&self, handler_id: &str, name: &str, version: Version) -> RouteResult<()> {
        self.existing_graph(handler_id)?;
        self.graphs
            .update(handler_id, |graph| graph.set_alias(name, version))?;
        Ok(())
    }

    pub fn publish(&self, handler_id: &str, version: &Version) -> RouteResult<()> {
        self.existing_graph(handler_id)?;
        self.graphs
            .update(handler_id, |graph| graph.publish(version))?;
        Ok(())
    }

    pub fn manifest(
        &self,
        handler_id: &str,
        version: Option<&Version>,
    ) -> RouteResult<Arc<HandlerManifest>> {
        self.manifests.get(handler_id, version)
    }

    /// Current graph snapshot of a handler
    pub fn graph(&self, handler_id: &str) -> RouteResult<Arc<HandlerGraph>> {
        self.existing_graph(handler_id)
    }

    pub fn manifests(&self) -> &ManifestStore {
        &self.manifests
    }

    /// Release every snapshot. Persisted manifests survive and are reloaded by `init`.
    pub fn teardown(&self) {
        self.graphs.clear();
        self.manifests.clear();
        info!("Registry torn down");
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            manifest_count: self.manifests.manifest_count(),
            ..Default::default()
        };
        for handler_id in self.graphs.handler_ids() {
            if let Some(graph) = self.graphs.get(&handler_id) {
                stats.handler_count += 1;
                stats.edge_count += graph.edge_count();
                stats.transformer_count += graph.transformer_count();
                stats.alias_count += graph.aliases().len();
            }
        }
        stats
    }

    fn existing_graph(&self, handler_id: &str) -> RouteResult<Arc<HandlerGraph>> {
        self.graphs
            .get(handler_id)
            .ok_or_else(|| RouteError::UnknownHandler(handler_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        manifest::YamlFileBackend,
        schema::GType,
        version::{Resolver, VersionSpec},
    };

    const CONF: &str = r#"
handlers:
  - id: getUser
    manifests:
      - version: 1.0.0
      - version: 1.1.0
      - version: 2.0.0
    published: [1.0.0]
    edges:
      - { from: 1.0.0, to: 1.1.0 }
      - { from: 1.1.0, to: 2.0.0 }
    aliases: { stable: 1.1.0 }
    transformers:
      - id: rename-name
        from: 1.1.0
        to: 2.0.0
        direction: request
        kind: rename-fields
        config: { fields: { name: full_name } }
        inverse: true
"#;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn test_init_from_config() {
        let registry = Registry::default();
        let stats = registry.init(&Config::from_yaml(CONF).unwrap()).unwrap();
        assert_eq!(
            stats,
            RegistryStats {
                handler_count: 1,
                manifest_count: 3,
                edge_count: 2,
                transformer_count: 2,
                alias_count: 1,
            }
        );

        let graph = registry.graph("getUser").unwrap();
        assert_eq!(
            Resolver::resolve(&graph, &VersionSpec::latest()).unwrap(),
            v("2.0.0")
        );
        let inverse = graph
            .transformer(&v("2.0.0"), &v("1.1.0"), Direction::Response)
            .unwrap();
        assert_eq!(inverse.id(), "rename-name-inverse");
        assert_eq!(
            inverse.apply(json!({"full_name": "ada"})).unwrap(),
            json!({"name": "ada"})
        );
    }

    #[test]
    fn test_init_rejects_cycles() {
        let conf = r#"
handlers:
  - id: h
    manifests: [ { version: 1.0.0 }, { version: 2.0.0 } ]
    edges:
      - { from: 1.0.0, to: 2.0.0 }
      - { from: 2.0.0, to: 1.0.0 }
"#;
        let registry = Registry::default();
        assert!(matches!(
            registry.init(&Config::from_yaml(conf).unwrap()),
            Err(RouteError::CyclicGraph { .. })
        ));
        // the failed edit was never published
        assert_eq!(registry.graph("h").unwrap().edge_count(), 0);
    }

    #[test]
    fn test_init_rejects_transformer_without_edge() {
        let conf = r#"
handlers:
  - id: h
    manifests: [ { version: 1.0.0 }, { version: 2.0.0 } ]
    transformers:
      - { id: t, from: 1.0.0, to: 2.0.0, direction: request, kind: drop-fields, config: { fields: [a] } }
"#;
        assert!(matches!(
            Registry::default().init(&Config::from_yaml(conf).unwrap()),
            Err(RouteError::Configuration(_))
        ));
    }

    #[test]
    fn test_programmatic_registration() {
        let registry = Registry::default();
        registry
            .register_manifest(
                HandlerManifest::new("h", v("1.0.0"), GType::any(), GType::any()),
                true,
            )
            .unwrap();
        registry
            .register_manifest(
                HandlerManifest::new("h", v("1.1.0"), GType::any(), GType::any()),
                false,
            )
            .unwrap();
        registry.add_edge("h", v("1.0.0"), v("1.1.0")).unwrap();
        registry.set_alias("h", "beta", v("1.1.0")).unwrap();

        assert!(matches!(
            registry.add_edge("missing", v("1.0.0"), v("1.1.0")),
            Err(RouteError::UnknownHandler(_))
        ));
        assert!(matches!(
            registry.register_manifest(
                HandlerManifest::new("h", v("1.0.0"), GType::any(), GType::any()),
                true,
            ),
            Err(RouteError::DuplicateVersion { .. })
        ));
        assert_eq!(registry.stats().alias_count, 1);
    }

    #[test]
    fn test_init_twice_without_teardown() {
        let conf = Config::from_yaml(CONF).unwrap();
        let registry = Registry::default();
        let first = registry.init(&conf).unwrap();
        assert_eq!(registry.init(&conf).unwrap(), first);

        // same slot, different transformer
        let renamed = Config::from_yaml(&CONF.replace("id: rename-name", "id: rename-other")).unwrap();
        assert!(matches!(
            registry.init(&renamed),
            Err(RouteError::Configuration(_))
        ));
    }

    #[test]
    fn test_teardown_and_reinit_from_backend() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifests.yaml");
        let conf = Config::from_yaml(CONF).unwrap();

        let registry = Registry::new(Arc::new(YamlFileBackend::new(&path)));
        registry.init(&conf).unwrap();
        registry.teardown();
        assert!(registry.graph("getUser").is_err());
        assert_eq!(registry.stats(), RegistryStats::default());

        // manifests come back from the file, config ones are not stored twice
        let stats = registry.init(&conf).unwrap();
        assert_eq!(stats.manifest_count, 3);
        assert_eq!(stats.edge_count, 2);
    }
}
