//! Handler manifests and the manifest store.
//!
//! The store is an in-process cache published through an `ArcSwap` snapshot, so
//! readers never take a lock. Writers serialize on a short mutex, persist through
//! the pluggable [`ManifestBackend`], then swap in a new snapshot.

pub mod backend;

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Mutex},
};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use log::{debug, info};
use semver::Version;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::{
    core::{ErrorContext, ManifestBackend, RouteError, RouteResult},
    schema::GType,
};

pub use backend::{MemoryBackend, YamlFileBackend};

/// Declarative record of one handler version. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct HandlerManifest {
    #[validate(custom(function = "crate::config::validate_handler_id"))]
    pub handler_id: String,
    pub version: Version,
    pub input_schema: GType,
    pub output_schema: GType,
    #[serde(default)]
    #[validate(custom(function = "HandlerManifest::validate_capabilities"))]
    pub capabilities: BTreeSet<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl HandlerManifest {
    pub fn new(
        handler_id: impl Into<String>,
        version: Version,
        input_schema: GType,
        output_schema: GType,
    ) -> Self {
        Self {
            handler_id: handler_id.into(),
            version,
            input_schema,
            output_schema,
            capabilities: BTreeSet::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    fn validate_capabilities(capabilities: &BTreeSet<String>) -> Result<(), ValidationError> {
        if capabilities.iter().any(|c| c.trim().is_empty()) {
            return Err(ValidationError::new("empty_capability"));
        }
        Ok(())
    }
}

type ManifestIndex = HashMap<String, BTreeMap<Version, Arc<HandlerManifest>>>;

/// Cached lookup of handler manifests by `(handler_id, version)`.
pub struct ManifestStore {
    snapshot: ArcSwap<ManifestIndex>,
    write_lock: Mutex<()>,
    backend: Arc<dyn ManifestBackend>,
}

impl Default for ManifestStore {
    fn default() -> Self {
        Self::new(Arc::new(MemoryBackend::default()))
    }
}

impl ManifestStore {
    pub fn new(backend: Arc<dyn ManifestBackend>) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(ManifestIndex::new()),
            write_lock: Mutex::new(()),
            backend,
        }
    }

    /// Store a new manifest, persisting it through the backend first.
    ///
    /// Fails with `DuplicateVersion` if `(handler_id, version)` already exists.
    pub fn store(&self, manifest: HandlerManifest) -> RouteResult<Arc<HandlerManifest>> {
        manifest.validate()?;
        let _guard = self
            .write_lock
            .lock()
            .with_context("manifest store lock")?;

        let current = self.snapshot.load_full();
        Self::ensure_absent(&current, &manifest)?;

        self.backend.persist(&manifest)?;
        let stored = Arc::new(manifest);
        self.publish(&current, vec![stored.clone()]);

        info!(
            "Stored manifest '{}' {}",
            stored.handler_id, stored.version
        );
        Ok(stored)
    }

    /// Load every manifest the backend already holds into the cache.
    ///
    /// Manifests already cached unchanged are skipped; a cached manifest that
    /// differs from the stored one is a `DuplicateVersion`. Returns the number
    /// of manifests newly loaded.
    pub fn hydrate(&self) -> RouteResult<usize> {
        let manifests = self.backend.load()?;
        let _guard = self
            .write_lock
            .lock()
            .with_context("manifest store lock")?;

        let current = self.snapshot.load_full();
        let mut staged = ManifestIndex::new();
        for manifest in &manifests {
            manifest.validate()?;
            let cached = current
                .get(&manifest.handler_id)
                .and_then(|versions| versions.get(&manifest.version));
            if cached.is_some_and(|cached| **cached == *manifest) {
                continue;
            }
            Self::ensure_absent(&current, manifest)?;
            Self::ensure_absent(&staged, manifest)?;
            staged
                .entry(manifest.handler_id.clone())
                .or_default()
                .insert(manifest.version.clone(), Arc::new(manifest.clone()));
        }

        let count: usize = staged.values().map(BTreeMap::len).sum();
        self.publish(
            &current,
            staged.into_values().flat_map(|m| m.into_values()).collect(),
        );
        debug!("Hydrated {count} manifest(s) from backend");
        Ok(count)
    }

    /// Look up a manifest; without a version, the most recently created one.
    pub fn get(
        &self,
        handler_id: &str,
        version: Option<&Version>,
    ) -> RouteResult<Arc<HandlerManifest>> {
        let snapshot = self.snapshot.load();
        let versions = snapshot
            .get(handler_id)
            .ok_or_else(|| RouteError::UnknownHandler(handler_id.to_string()))?;

        let found = match version {
            Some(v) => versions.get(v).cloned(),
            None => versions
                .values()
                .max_by(|a, b| {
                    a.created_at
                        .cmp(&b.created_at)
                        .then_with(|| a.version.cmp(&b.version))
                })
                .cloned(),
        };

        found.ok_or_else(|| RouteError::VersionNotFound {
            handler_id: handler_id.to_string(),
            spec: version.map_or_else(|| "<latest created>".to_string(), |v| v.to_string()),
        })
    }

    /// Every manifest registered for a handler, in no particular order.
    pub fn list_versions(&self, handler_id: &str) -> Vec<Arc<HandlerManifest>> {
        self.snapshot
            .load()
            .get(handler_id)
            .map(|versions| versions.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, handler_id: &str, version: &Version) -> bool {
        self.snapshot
            .load()
            .get(handler_id)
            .is_some_and(|versions| versions.contains_key(version))
    }

    pub fn handler_ids(&self) -> Vec<String> {
        self.snapshot.load().keys().cloned().collect()
    }

    pub fn manifest_count(&self) -> usize {
        self.snapshot.load().values().map(BTreeMap::len).sum()
    }

    /// Drop the cached snapshot. Persisted manifests are untouched.
    pub fn clear(&self) {
        self.snapshot.store(Arc::new(ManifestIndex::new()));
    }

    fn ensure_absent(index: &ManifestIndex, manifest: &HandlerManifest) -> RouteResult<()> {
        let exists = index
            .get(&manifest.handler_id)
            .is_some_and(|versions| versions.contains_key(&manifest.version));
        if exists {
            return Err(RouteError::DuplicateVersion {
                handler_id: manifest.handler_id.clone(),
                version: manifest.version.to_string(),
            });
        }
        Ok(())
    }

    fn publish(&self, current: &ManifestIndex, added: Vec<Arc<HandlerManifest>>) {
        let mut next = current.clone();
        for manifest in added {
            next.entry(manifest.handler_id.clone())
                .or_default()
                .insert(manifest.version.clone(), manifest);
        }
        self.snapshot.store(Arc::new(next));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn manifest(id: &str, version: &str, created_secs: i64) -> HandlerManifest {
        HandlerManifest::new(
            id,
            Version::parse(version).unwrap(),
            GType::any(),
            GType::any(),
        )
        .with_created_at(Utc.timestamp_opt(created_secs, 0).unwrap())
    }

    #[test]
    fn test_store_rejects_duplicate_version() {
        let store = ManifestStore::default();
        store.store(manifest("getUser", "1.0.0", 10)).unwrap();

        let err = store.store(manifest("getUser", "1.0.0", 20)).unwrap_err();
        assert!(matches!(err, RouteError::DuplicateVersion { .. }));
        assert_eq!(store.manifest_count(), 1);
    }

    #[test]
    fn test_get_without_version_returns_latest_created() {
        let store = ManifestStore::default();
        store.store(manifest("getUser", "2.0.0", 10)).unwrap();
        store.store(manifest("getUser", "1.5.0", 30)).unwrap();
        store.store(manifest("getUser", "1.0.0", 20)).unwrap();

        let latest = store.get("getUser", None).unwrap();
        assert_eq!(latest.version, Version::new(1, 5, 0));

        let exact = store.get("getUser", Some(&Version::new(2, 0, 0))).unwrap();
        assert_eq!(exact.created_at.timestamp(), 10);
    }

    #[test]
    fn test_get_missing() {
        let store = ManifestStore::default();
        assert!(matches!(
            store.get("nope", None),
            Err(RouteError::UnknownHandler(_))
        ));

        store.store(manifest("getUser", "1.0.0", 1)).unwrap();
        assert!(matches!(
            store.get("getUser", Some(&Version::new(9, 0, 0))),
            Err(RouteError::VersionNotFound { .. })
        ));
    }

    #[test]
    fn test_list_versions() {
        let store = ManifestStore::default();
        store.store(manifest("a", "1.0.0", 1)).unwrap();
        store.store(manifest("a", "1.1.0", 2)).unwrap();
        store.store(manifest("b", "1.0.0", 3)).unwrap();

        let mut versions: Vec<String> = store
            .list_versions("a")
            .iter()
            .map(|m| m.version.to_string())
            .collect();
        versions.sort();
        assert_eq!(versions, vec!["1.0.0", "1.1.0"]);
        assert!(store.list_versions("c").is_empty());
    }

    #[test]
    fn test_readers_keep_old_snapshot() {
        let store = ManifestStore::default();
        store.store(manifest("a", "1.0.0", 1)).unwrap();
        let before = store.snapshot.load_full();
        store.store(manifest("a", "2.0.0", 2)).unwrap();

        assert_eq!(before.get("a").map(BTreeMap::len), Some(1));
        assert_eq!(store.list_versions("a").len(), 2);
    }

    #[test]
    fn test_invalid_handler_id_rejected() {
        let store = ManifestStore::default();
        let err = store.store(manifest("bad id!", "1.0.0", 1)).unwrap_err();
        assert!(matches!(err, RouteError::Configuration(_)));
    }
}
