use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use log::debug;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use validator::Validate;

use crate::{
    core::{Exchange, Hook, RouteError, RouteResult},
    hook::HookError,
};

pub const HOOK_NAME: &str = "fault-injection";

/// Creates a fault-injection hook that delays or fails a share of requests.
pub fn create_fault_injection_hook(cfg: JsonValue) -> RouteResult<Arc<dyn Hook>> {
    let config = HookConfig::try_from(cfg)?;
    Ok(Arc::new(HookFaultInjection { config }))
}

/// Configuration for delaying requests
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
struct DelayConfig {
    duration_ms: u64,

    /// Percentage of requests to delay (0-100). If not set, delays all requests.
    #[serde(default)]
    #[validate(range(min = 0, max = 100))]
    percentage: Option<u32>,
}

/// Configuration for failing requests
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
struct AbortConfig {
    #[serde(default = "AbortConfig::default_message")]
    #[validate(length(min = 1))]
    message: String,

    /// Report the failure as transient, so idempotent hooks retry it
    #[serde(default)]
    transient: bool,

    /// Percentage of requests to fail (0-100). If not set, fails all requests.
    #[serde(default)]
    #[validate(range(min = 0, max = 100))]
    percentage: Option<u32>,
}

impl AbortConfig {
    fn default_message() -> String {
        "injected fault".to_string()
    }
}

#[derive(Debug, Serialize, Deserialize, Validate)]
struct HookConfig {
    #[serde(default)]
    #[validate(nested)]
    delay: Option<DelayConfig>,

    #[serde(default)]
    #[validate(nested)]
    abort: Option<AbortConfig>,
}

impl TryFrom<JsonValue> for HookConfig {
    type Error = RouteError;

    fn try_from(value: JsonValue) -> Result<Self, Self::Error> {
        let config: HookConfig = serde_json::from_value(value).map_err(|e| {
            RouteError::serialization_error("Invalid fault injection hook config", e)
        })?;

        config.validate()?;

        if config.delay.is_none() && config.abort.is_none() {
            return Err(RouteError::Configuration(
                "At least one of 'delay' or 'abort' must be configured".to_string(),
            ));
        }

        Ok(config)
    }
}

pub struct HookFaultInjection {
    config: HookConfig,
}

impl HookFaultInjection {
    fn sample_hit(percentage: Option<u32>) -> bool {
        match percentage {
            None => true,
            Some(pct) => rand::thread_rng().gen_range(1..=100) <= pct,
        }
    }
}

#[async_trait]
impl Hook for HookFaultInjection {
    fn name(&self) -> &str {
        HOOK_NAME
    }

    async fn call(&self, exchange: &mut Exchange) -> Result<(), HookError> {
        if let Some(delay) = &self.config.delay {
            if Self::sample_hit(delay.percentage) {
                debug!(
                    "[{}] injecting {}ms delay",
                    exchange.correlation_id(),
                    delay.duration_ms
                );
                tokio::time::sleep(Duration::from_millis(delay.duration_ms)).await;
            }
        }

        if let Some(abort) = &self.config.abort {
            if Self::sample_hit(abort.percentage) {
                return Err(if abort.transient {
                    HookError::transient(abort.message.clone())
                } else {
                    HookError::new(abort.message.clone())
                });
            }
        }
        Ok(())
    }
}
