//! Manifest storage backends.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use log::{debug, trace};

use crate::core::{ErrorContext, ManifestBackend, RouteError, RouteResult};

use super::HandlerManifest;

/// Backend that keeps nothing beyond the in-process cache.
#[derive(Default)]
pub struct MemoryBackend {
    seed: Vec<HandlerManifest>,
}

impl MemoryBackend {
    /// Backend whose `load` returns the given manifests.
    pub fn with_manifests(seed: Vec<HandlerManifest>) -> Self {
        Self { seed }
    }
}

impl ManifestBackend for MemoryBackend {
    fn persist(&self, _manifest: &HandlerManifest) -> RouteResult<()> {
        Ok(())
    }

    fn load(&self) -> RouteResult<Vec<HandlerManifest>> {
        Ok(self.seed.clone())
    }
}

/// Backend persisting every manifest into a single YAML document.
pub struct YamlFileBackend {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl YamlFileBackend {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    fn read_all(&self) -> RouteResult<Vec<HandlerManifest>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)?;
        trace!("Read manifest file {}: {content}", self.path.display());
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_yaml::from_str(&content).map_err(|e| {
            RouteError::serialization_error(
                &format!("Unable to parse manifest file {}", self.path.display()),
                e,
            )
        })
    }
}

impl ManifestBackend for YamlFileBackend {
    fn persist(&self, manifest: &HandlerManifest) -> RouteResult<()> {
        let _guard = self
            .write_lock
            .lock()
            .with_context("manifest file lock")?;

        let mut manifests = self.read_all()?;
        if manifests
            .iter()
            .any(|m| m.handler_id == manifest.handler_id && m.version == manifest.version)
        {
            return Err(RouteError::DuplicateVersion {
                handler_id: manifest.handler_id.clone(),
                version: manifest.version.to_string(),
            });
        }
        manifests.push(manifest.clone());

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.path, serde_yaml::to_string(&manifests)?)?;
        debug!(
            "Persisted manifest '{}' {} to {}",
            manifest.handler_id,
            manifest.version,
            self.path.display()
        );
        Ok(())
    }

    fn load(&self) -> RouteResult<Vec<HandlerManifest>> {
        self.read_all()
    }
}
