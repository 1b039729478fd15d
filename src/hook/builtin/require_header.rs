use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use validator::Validate;

use crate::{
    core::{Exchange, Hook, RouteError, RouteResult},
    hook::HookError,
};

pub const HOOK_NAME: &str = "require-header";

/// Creates a guard rejecting requests without the configured header.
///
/// The accepted value is stored in the local context under `header.<name>`.
pub fn create_require_header_hook(cfg: JsonValue) -> RouteResult<Arc<dyn Hook>> {
    let config = HookConfig::try_from(cfg)?;
    Ok(Arc::new(HookRequireHeader { config }))
}

#[derive(Debug, Serialize, Deserialize, Validate)]
struct HookConfig {
    #[validate(length(min = 1))]
    header: String,

    /// Accepted values; any value is accepted when empty
    #[serde(default)]
    values: Vec<String>,
}

impl TryFrom<JsonValue> for HookConfig {
    type Error = RouteError;

    fn try_from(value: JsonValue) -> Result<Self, Self::Error> {
        let config: HookConfig = serde_json::from_value(value).map_err(|e| {
            RouteError::serialization_error("Invalid require-header hook config", e)
        })?;
        config.validate()?;
        Ok(config)
    }
}

pub struct HookRequireHeader {
    config: HookConfig,
}

#[async_trait]
impl Hook for HookRequireHeader {
    fn name(&self) -> &str {
        HOOK_NAME
    }

    async fn call(&self, exchange: &mut Exchange) -> Result<(), HookError> {
        let header = &self.config.header;
        let value = exchange
            .request
            .header(header)
            .ok_or_else(|| HookError::new(format!("missing required header '{header}'")))?
            .to_string();

        if !self.config.values.is_empty() && !self.config.values.contains(&value) {
            return Err(HookError::new(format!(
                "header '{header}' has unexpected value '{value}'"
            )));
        }

        exchange
            .local
            .set(format!("header.{}", header.to_ascii_lowercase()), value);
        Ok(())
    }
}
