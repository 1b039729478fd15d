use std::{str::FromStr, sync::Arc};

use async_trait::async_trait;
use log::Level;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use validator::{Validate, ValidationError};

use crate::{
    core::{Exchange, Hook, RouteError, RouteResult},
    hook::HookError,
};

pub const HOOK_NAME: &str = "access-log";

/// Creates an access-log hook. Usually registered in the after and catch phases.
pub fn create_access_log_hook(cfg: JsonValue) -> RouteResult<Arc<dyn Hook>> {
    let config = HookConfig::try_from(cfg)?;
    let level = Level::from_str(&config.level).unwrap_or(Level::Info);
    Ok(Arc::new(HookAccessLog { config, level }))
}

#[derive(Debug, Serialize, Deserialize, Validate)]
struct HookConfig {
    #[serde(default = "HookConfig::default_level")]
    #[validate(custom(function = "HookConfig::validate_level"))]
    level: String,

    /// Log target, defaults to the crate's access target
    #[serde(default = "HookConfig::default_target")]
    target: String,
}

impl HookConfig {
    fn default_level() -> String {
        "info".to_string()
    }

    fn default_target() -> String {
        "timescape::access".to_string()
    }

    fn validate_level(level: &str) -> Result<(), ValidationError> {
        Level::from_str(level)
            .map(|_| ())
            .map_err(|_| ValidationError::new("invalid_log_level"))
    }
}

impl TryFrom<JsonValue> for HookConfig {
    type Error = RouteError;

    fn try_from(value: JsonValue) -> Result<Self, Self::Error> {
        let config: HookConfig = serde_json::from_value(value)
            .map_err(|e| RouteError::serialization_error("Invalid access-log hook config", e))?;
        config.validate()?;
        Ok(config)
    }
}

pub struct HookAccessLog {
    config: HookConfig,
    level: Level,
}

impl HookAccessLog {
    fn render(exchange: &Exchange) -> String {
        let status = exchange
            .response
            .get_status()
            .map_or_else(|| "-".to_string(), |s| s.as_u16().to_string());
        match exchange.failure() {
            Some(failure) => format!(
                "[{}] {} {} status={status} failed_stage={} kind={} {}",
                exchange.correlation_id(),
                exchange.handler_id(),
                exchange.resolved_version(),
                failure.stage,
                failure.kind,
                failure.message
            ),
            None => format!(
                "[{}] {} {} status={status}",
                exchange.correlation_id(),
                exchange.handler_id(),
                exchange.resolved_version()
            ),
        }
    }
}

#[async_trait]
impl Hook for HookAccessLog {
    fn name(&self) -> &str {
        HOOK_NAME
    }

    async fn call(&self, exchange: &mut Exchange) -> Result<(), HookError> {
        log::log!(target: self.config.target.as_str(), self.level, "{}", Self::render(exchange));
        Ok(())
    }
}
