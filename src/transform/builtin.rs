//! Built-in transformers that can be declared from configuration.
//!
//! Fields are addressed by dotted paths (`user.address.zip`), intermediate
//! objects are created on insert.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use validator::Validate;

use super::TransformerSpec;
use crate::core::{RouteError, RouteResult, Transformer};

pub type TransformerCreateFn = fn(TransformerSpec, JsonValue) -> RouteResult<Arc<dyn Transformer>>;

pub const DROP_FIELDS: &str = "drop-fields";
pub const RENAME_FIELDS: &str = "rename-fields";
pub const SET_DEFAULTS: &str = "set-defaults";

static TRANSFORMER_BUILDER_REGISTRY: Lazy<HashMap<&'static str, TransformerCreateFn>> =
    Lazy::new(|| {
        let arr: Vec<(&str, TransformerCreateFn)> = vec![
            (DROP_FIELDS, create_drop_fields),
            (RENAME_FIELDS, create_rename_fields),
            (SET_DEFAULTS, create_set_defaults),
        ];
        arr.into_iter().collect()
    });

/// Build a transformer of the named kind.
pub fn build_transformer(
    kind: &str,
    spec: TransformerSpec,
    cfg: JsonValue,
) -> RouteResult<Arc<dyn Transformer>> {
    let builder = TRANSFORMER_BUILDER_REGISTRY
        .get(kind)
        .ok_or_else(|| RouteError::Configuration(format!("Unknown transformer kind '{kind}'")))?;
    builder(spec, cfg)
}

/// Kind and config of the transformer undoing `kind`, when it is invertible.
///
/// `set-defaults` inverts to dropping the defaulted fields, which only restores
/// payloads that did not carry those fields to begin with.
pub fn inverse_config(kind: &str, cfg: &JsonValue) -> RouteResult<Option<(&'static str, JsonValue)>> {
    match kind {
        RENAME_FIELDS => {
            let config = RenameFieldsConfig::try_from(cfg.clone())?;
            let fields: BTreeMap<String, String> =
                config.fields.into_iter().map(|(k, v)| (v, k)).collect();
            Ok(Some((RENAME_FIELDS, serde_json::json!({ "fields": fields }))))
        }
        SET_DEFAULTS => {
            let config = SetDefaultsConfig::try_from(cfg.clone())?;
            let fields: Vec<String> = config.values.into_keys().collect();
            Ok(Some((DROP_FIELDS, serde_json::json!({ "fields": fields }))))
        }
        DROP_FIELDS => Ok(None),
        other => Err(RouteError::Configuration(format!(
            "Unknown transformer kind '{other}'"
        ))),
    }
}

/// Transformer backed by a closure, for handlers registered in code
pub struct FnTransformer<F> {
    spec: TransformerSpec,
    f: F,
}

impl<F> FnTransformer<F>
where
    F: Fn(JsonValue) -> RouteResult<JsonValue> + Send + Sync,
{
    pub fn new(spec: TransformerSpec, f: F) -> Self {
        Self { spec, f }
    }
}

impl<F> Transformer for FnTransformer<F>
where
    F: Fn(JsonValue) -> RouteResult<JsonValue> + Send + Sync,
{
    fn spec(&self) -> &TransformerSpec {
        &self.spec
    }

    fn apply(&self, payload: JsonValue) -> RouteResult<JsonValue> {
        (self.f)(payload)
    }
}

#[derive(Debug, Serialize, Deserialize, Validate)]
struct DropFieldsConfig {
    #[validate(length(min = 1))]
    fields: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
struct RenameFieldsConfig {
    /// old path -> new path
    #[validate(length(min = 1))]
    fields: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
struct SetDefaultsConfig {
    #[validate(length(min = 1))]
    values: BTreeMap<String, JsonValue>,
}

macro_rules! impl_try_from_json {
    ($ty:ty, $what:literal) => {
        impl TryFrom<JsonValue> for $ty {
            type Error = RouteError;

            fn try_from(value: JsonValue) -> Result<Self, Self::Error> {
                let config: $ty = serde_json::from_value(value).map_err(|e| {
                    RouteError::serialization_error(concat!("Invalid ", $what, " config"), e)
                })?;
                config.validate()?;
                Ok(config)
            }
        }
    };
}

impl_try_from_json!(DropFieldsConfig, "drop-fields");
impl_try_from_json!(RenameFieldsConfig, "rename-fields");
impl_try_from_json!(SetDefaultsConfig, "set-defaults");

fn create_drop_fields(spec: TransformerSpec, cfg: JsonValue) -> RouteResult<Arc<dyn Transformer>> {
    let config = DropFieldsConfig::try_from(cfg)?;
    Ok(Arc::new(DropFields { spec, config }))
}

fn create_rename_fields(
    spec: TransformerSpec,
    cfg: JsonValue,
) -> RouteResult<Arc<dyn Transformer>> {
    let config = RenameFieldsConfig::try_from(cfg)?;
    Ok(Arc::new(RenameFields { spec, config }))
}

fn create_set_defaults(spec: TransformerSpec, cfg: JsonValue) -> RouteResult<Arc<dyn Transformer>> {
    let config = SetDefaultsConfig::try_from(cfg)?;
    Ok(Arc::new(SetDefaults { spec, config }))
}

struct DropFields {
    spec: TransformerSpec,
    config: DropFieldsConfig,
}

impl Transformer for DropFields {
    fn spec(&self) -> &TransformerSpec {
        &self.spec
    }

    fn apply(&self, mut payload: JsonValue) -> RouteResult<JsonValue> {
        expect_object(&self.spec, &payload)?;
        for path in &self.config.fields {
            take_path(&mut payload, path);
        }
        Ok(payload)
    }
}

struct RenameFields {
    spec: TransformerSpec,
    config: RenameFieldsConfig,
}

impl Transformer for RenameFields {
    fn spec(&self) -> &TransformerSpec {
        &self.spec
    }

    fn apply(&self, mut payload: JsonValue) -> RouteResult<JsonValue> {
        expect_object(&self.spec, &payload)?;
        // take everything first so swapped names do not clobber each other
        let moved: Vec<(&String, JsonValue)> = self
            .config
            .fields
            .iter()
            .filter_map(|(old, new)| take_path(&mut payload, old).map(|v| (new, v)))
            .collect();
        for (new, value) in moved {
            insert_path(&mut payload, new, value).map_err(|message| RouteError::Transformer {
                transformer_id: self.spec.id.clone(),
                message,
            })?;
        }
        Ok(payload)
    }
}

struct SetDefaults {
    spec: TransformerSpec,
    config: SetDefaultsConfig,
}

impl Transformer for SetDefaults {
    fn spec(&self) -> &TransformerSpec {
        &self.spec
    }

    fn apply(&self, mut payload: JsonValue) -> RouteResult<JsonValue> {
        expect_object(&self.spec, &payload)?;
        for (path, value) in &self.config.values {
            if get_path(&payload, path).is_none() {
                insert_path(&mut payload, path, value.clone()).map_err(|message| {
                    RouteError::Transformer {
                        transformer_id: self.spec.id.clone(),
                        message,
                    }
                })?;
            }
        }
        Ok(payload)
    }
}

fn expect_object(spec: &TransformerSpec, payload: &JsonValue) -> RouteResult<()> {
    if payload.is_object() {
        Ok(())
    } else {
        Err(RouteError::Transformer {
            transformer_id: spec.id.clone(),
            message: format!(
                "expected an object payload, got {}",
                crate::schema::value_kind(payload)
            ),
        })
    }
}

fn get_path<'a>(value: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    path.split('.').try_fold(value, |v, key| v.get(key))
}

fn take_path(value: &mut JsonValue, path: &str) -> Option<JsonValue> {
    let (parent, key) = match path.rsplit_once('.') {
        Some((parent, key)) => (
            parent
                .split('.')
                .try_fold(value, |v, k| v.get_mut(k))?,
            key,
        ),
        None => (value, path),
    };
    parent.as_object_mut()?.remove(key)
}

fn insert_path(value: &mut JsonValue, path: &str, new: JsonValue) -> Result<(), String> {
    let mut segments = path.split('.').peekable();
    let mut current = value;
    while let Some(segment) = segments.next() {
        let object = current
            .as_object_mut()
            .ok_or_else(|| format!("cannot set '{path}': '{segment}' has a non-object parent"))?;
        if segments.peek().is_none() {
            object.insert(segment.to_string(), new);
            return Ok(());
        }
        current = object
            .entry(segment.to_string())
            .or_insert_with(|| JsonValue::Object(Map::new()));
    }
    Ok(())
}
