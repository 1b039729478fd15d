//! Hooks that can be declared from configuration.

pub mod access_log;
pub mod fault_injection;
pub mod require_header;

use std::{collections::HashMap, sync::Arc};

use once_cell::sync::Lazy;
use serde_json::Value as JsonValue;

use crate::core::{Hook, RouteError, RouteResult};

pub type HookCreateFn = fn(JsonValue) -> RouteResult<Arc<dyn Hook>>;

/// Global registry mapping hook names to their factory functions.
static HOOK_BUILDER_REGISTRY: Lazy<HashMap<&'static str, HookCreateFn>> = Lazy::new(|| {
    let arr: Vec<(&str, HookCreateFn)> = vec![
        (access_log::HOOK_NAME, access_log::create_access_log_hook),
        (
            fault_injection::HOOK_NAME,
            fault_injection::create_fault_injection_hook,
        ),
        (
            require_header::HOOK_NAME,
            require_header::create_require_header_hook,
        ),
    ];
    arr.into_iter().collect()
});

/// Creates a hook instance from configuration.
///
/// A `null` config is treated as an empty object. Fails fast for unknown hook names.
pub fn build_hook(name: &str, cfg: JsonValue) -> RouteResult<Arc<dyn Hook>> {
    let builder = HOOK_BUILDER_REGISTRY
        .get(name)
        .ok_or_else(|| RouteError::Configuration(format!("Unknown hook type: {name}")))?;
    let cfg = match cfg {
        JsonValue::Null => JsonValue::Object(Default::default()),
        cfg => cfg,
    };
    builder(cfg)
}

/// Names of every hook `build_hook` knows.
pub fn hook_names() -> Vec<&'static str> {
    let mut names: Vec<_> = HOOK_BUILDER_REGISTRY.keys().copied().collect();
    names.sort_unstable();
    names
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_build_known_hooks() {
        assert_eq!(
            hook_names(),
            vec!["access-log", "fault-injection", "require-header"]
        );
        assert_eq!(build_hook("access-log", JsonValue::Null).unwrap().name(), "access-log");
        assert!(build_hook("require-header", json!({"header": "x-tenant"})).is_ok());
    }

    #[test]
    fn test_unknown_hook() {
        assert!(matches!(
            build_hook("nope", json!({})),
            Err(RouteError::Configuration(_))
        ));
    }
}
