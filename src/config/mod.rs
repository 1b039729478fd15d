use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    fs,
    time::Duration,
};

use chrono::{DateTime, Utc};
use log::{debug, trace};
use once_cell::sync::Lazy;
use regex::Regex;
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use validator::{Validate, ValidationError};

use crate::{
    config_error,
    core::{RouteError, RouteResult},
    hook::{build_hook, HookDescriptor, HookSet, Phase, RetryPolicy, Scope},
    manifest::HandlerManifest,
    schema::GType,
    transform::Direction,
};

static HANDLER_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.-]+$").expect("Invalid handler id pattern"));

/// Handler ids are path-safe tokens.
pub fn validate_handler_id(id: &str) -> Result<(), ValidationError> {
    if HANDLER_ID_RE.is_match(id) {
        Ok(())
    } else {
        let mut err = ValidationError::new("invalid_handler_id");
        err.add_param("id".into(), &id.to_string());
        Err(err)
    }
}

#[derive(Default, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Config::validate_handler_ids"))]
pub struct Config {
    #[validate(nested)]
    #[serde(default)]
    pub log: Option<Log>,

    #[validate(nested)]
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[validate(nested)]
    #[serde(default)]
    pub health: HealthConfig,

    #[validate(nested)]
    #[serde(default)]
    pub global_hooks: Vec<HookConfig>,

    #[validate(nested)]
    #[serde(default)]
    pub handlers: Vec<HandlerConfig>,
}

// Config file load and validation
impl Config {
    pub fn load_from_yaml<P>(path: P) -> RouteResult<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path)
            .map_err(|e| config_error!("Unable to read conf file from {}: {}", path, e))?;
        debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    pub fn from_yaml(conf_str: &str) -> RouteResult<Self> {
        trace!("Read conf file: {conf_str}");
        let conf: Config = serde_yaml::from_str(conf_str)
            .map_err(|e| config_error!("Unable to parse yaml conf: {}", e))?;

        trace!("Loaded conf: {conf:?}");

        conf.validate()?;

        Ok(conf)
    }

    pub fn to_yaml(&self) -> RouteResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn handler(&self, id: &str) -> Option<&HandlerConfig> {
        self.handlers.iter().find(|h| h.id == id)
    }

    /// Global hooks, built and ordered.
    pub fn global_hook_set(&self) -> RouteResult<HookSet> {
        build_hook_set(&self.global_hooks, Scope::Global, &self.orchestrator)
    }

    fn validate_handler_ids(&self) -> Result<(), ValidationError> {
        let mut seen = HashSet::new();
        for handler in &self.handlers {
            if !seen.insert(handler.id.as_str()) {
                let mut err = ValidationError::new("duplicate_handler_id");
                err.add_param("id".into(), &handler.id);
                return Err(err);
            }
        }
        Ok(())
    }
}

/// Build hook descriptors of one scope from their configs.
pub fn build_hook_set(
    hooks: &[HookConfig],
    scope: Scope,
    defaults: &OrchestratorConfig,
) -> RouteResult<HookSet> {
    hooks
        .iter()
        .map(|hook| hook.descriptor(scope, defaults))
        .collect::<RouteResult<Vec<_>>>()
        .map(HookSet::from_descriptors)
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Log {
    #[validate(length(min = 1))]
    pub path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct OrchestratorConfig {
    /// Timeout of hooks that do not set their own
    #[serde(default = "OrchestratorConfig::default_timeout_ms")]
    #[validate(range(min = 1))]
    pub default_timeout_ms: u64,

    /// Retry policy of idempotent hooks that do not set their own
    #[serde(default)]
    #[validate(nested)]
    pub retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: Self::default_timeout_ms(),
            retry: RetryPolicy::default(),
        }
    }
}

impl OrchestratorConfig {
    fn default_timeout_ms() -> u64 {
        1000
    }
}

/// Rolling health window per `(handler_id, version)`
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "HealthConfig::validate_min_samples"))]
pub struct HealthConfig {
    #[serde(default = "HealthConfig::default_window")]
    #[validate(range(min = 1))]
    pub window: usize,

    /// Outcomes required before a version can be judged degraded
    #[serde(default = "HealthConfig::default_min_samples")]
    pub min_samples: usize,

    /// Failure ratio above which a version is degraded
    #[serde(default = "HealthConfig::default_failure_threshold")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub failure_threshold: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window: Self::default_window(),
            min_samples: Self::default_min_samples(),
            failure_threshold: Self::default_failure_threshold(),
        }
    }
}

impl HealthConfig {
    fn default_window() -> usize {
        50
    }

    fn default_min_samples() -> usize {
        10
    }

    fn default_failure_threshold() -> f64 {
        0.5
    }

    fn validate_min_samples(&self) -> Result<(), ValidationError> {
        if self.min_samples > self.window {
            Err(ValidationError::new("min_samples_exceeds_window"))
        } else {
            Ok(())
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct HookConfig {
    /// Name of a built-in hook
    #[validate(length(min = 1))]
    pub name: String,

    pub phase: Phase,

    #[serde(default)]
    #[validate(range(min = 1))]
    pub timeout_ms: Option<u64>,

    #[serde(default)]
    pub idempotent: bool,

    #[serde(default)]
    #[validate(nested)]
    pub retry: Option<RetryPolicy>,

    #[serde(default)]
    pub priority: i32,

    #[serde(default)]
    pub config: JsonValue,
}

impl HookConfig {
    pub fn descriptor(
        &self,
        scope: Scope,
        defaults: &OrchestratorConfig,
    ) -> RouteResult<HookDescriptor> {
        let hook = build_hook(&self.name, self.config.clone())?;
        let timeout = Duration::from_millis(self.timeout_ms.unwrap_or(defaults.default_timeout_ms));
        Ok(HookDescriptor::new(scope, self.phase, hook)
            .with_timeout(timeout)
            .with_retry(self.retry.clone().unwrap_or_else(|| defaults.retry.clone()))
            .idempotent(self.idempotent)
            .with_priority(self.priority))
    }
}

/// One manifest of a handler, as declared in configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManifestConfig {
    pub version: Version,
    #[serde(default = "GType::any")]
    pub input_schema: GType,
    #[serde(default = "GType::any")]
    pub output_schema: GType,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl ManifestConfig {
    pub fn to_manifest(&self, handler_id: &str) -> HandlerManifest {
        let manifest = HandlerManifest::new(
            handler_id,
            self.version.clone(),
            self.input_schema.clone(),
            self.output_schema.clone(),
        )
        .with_capabilities(self.capabilities.iter().cloned());
        match self.created_at {
            Some(created_at) => manifest.with_created_at(created_at),
            None => manifest,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EdgeConfig {
    pub from: Version,
    pub to: Version,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct TransformerConfig {
    #[validate(length(min = 1))]
    pub id: String,
    pub from: Version,
    pub to: Version,
    pub direction: Direction,
    /// Name of a built-in transformer
    #[validate(length(min = 1))]
    pub kind: String,
    #[serde(default)]
    pub config: JsonValue,
    /// Also register the inverse transformer, in the opposite direction
    #[serde(default)]
    pub inverse: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "HandlerConfig::validate_references"))]
pub struct HandlerConfig {
    #[validate(custom(function = "validate_handler_id"))]
    pub id: String,

    #[validate(length(min = 1))]
    pub manifests: Vec<ManifestConfig>,

    /// Roots of the graph; every manifest when empty
    #[serde(default)]
    pub published: Vec<Version>,

    #[serde(default)]
    pub edges: Vec<EdgeConfig>,

    #[serde(default)]
    pub aliases: BTreeMap<String, Version>,

    #[validate(nested)]
    #[serde(default)]
    pub transformers: Vec<TransformerConfig>,

    /// Hooks of route scope
    #[validate(nested)]
    #[serde(default)]
    pub hooks: Vec<HookConfig>,

    /// Hooks of local scope
    #[validate(nested)]
    #[serde(default)]
    pub local_hooks: Vec<HookConfig>,
}

impl HandlerConfig {
    pub fn is_published(&self, version: &Version) -> bool {
        self.published.is_empty() || self.published.contains(version)
    }

    fn validate_references(&self) -> Result<(), ValidationError> {
        let mut declared = HashSet::new();
        for manifest in &self.manifests {
            if !declared.insert(&manifest.version) {
                return Err(reference_error("duplicate_manifest_version", &manifest.version));
            }
        }

        let referenced = self
            .published
            .iter()
            .chain(self.edges.iter().flat_map(|e| [&e.from, &e.to]))
            .chain(self.aliases.values())
            .chain(self.transformers.iter().flat_map(|t| [&t.from, &t.to]));
        for version in referenced {
            if !declared.contains(version) {
                return Err(reference_error("undeclared_version", version));
            }
        }

        let mut ids = HashSet::new();
        for transformer in &self.transformers {
            if !ids.insert(transformer.id.as_str()) {
                let mut err = ValidationError::new("duplicate_transformer_id");
                err.add_param("id".into(), &transformer.id);
                return Err(err);
            }
        }
        Ok(())
    }
}

fn reference_error(code: &'static str, version: &Version) -> ValidationError {
    let mut err = ValidationError::new(code);
    err.add_param("version".into(), &version.to_string());
    err
}

impl TryFrom<&str> for Config {
    type Error = RouteError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::from_yaml(value)
    }
}
