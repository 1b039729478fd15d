use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use http::StatusCode;
use semver::Version;
use serde_json::{json, Value};

use super::*;
use crate::{
    config::Config,
    core::{BoxError, Exchange, Hook, LocalContext, PayloadSide, ResponseBuilder},
    hook::{
        event::stages, Backoff, HookError, MemoryEventSink, Outcome, Phase, RetryPolicy, Stage,
    },
    manifest::HandlerManifest,
    schema::GType,
};

const CONF: &str = r#"
health:
  window: 4
  min_samples: 2
  failure_threshold: 0.5

handlers:
  - id: getUser
    manifests:
      - version: 1.0.0
      - version: 1.1.0
        input_schema:
          type: object
          required: [id]
          fields:
            id: { type: primitive, kind: integer }
        output_schema:
          type: object
          additional: false
          fields:
            id: { type: primitive, kind: integer }
            name: { type: primitive, kind: string }
            locale: { type: primitive, kind: string }
      - version: 2.0.0
    published: [1.0.0]
    edges:
      - { from: 1.0.0, to: 1.1.0 }
      - { from: 1.1.0, to: 2.0.0 }
    transformers:
      - id: default-locale
        from: 1.1.0
        to: 2.0.0
        direction: request
        kind: set-defaults
        config: { values: { locale: en } }
      - id: drop-email
        from: 2.0.0
        to: 1.1.0
        direction: response
        kind: drop-fields
        config: { fields: [email] }
"#;

/// Handler authored against getUser 2.0.0. User 0 makes the store fail.
struct GetUser;

#[async_trait]
impl Handler for GetUser {
    async fn handle(
        &self,
        request: &HandlerRequest,
        response: &mut ResponseBuilder,
        _global: &GlobalContext,
        _local: &mut LocalContext,
    ) -> Result<(), BoxError> {
        let id = request
            .body
            .get("id")
            .and_then(Value::as_i64)
            .ok_or("id missing")?;
        if id == 0 {
            return Err("user store unavailable".into());
        }
        let locale = request.body.get("locale").cloned().unwrap_or(Value::Null);
        response.status(StatusCode::OK).body(json!({
            "id": id,
            "name": "Ada",
            "email": "ada@example.com",
            "locale": locale,
        }));
        Ok(())
    }
}

enum Behaviour {
    Pass,
    Fail,
    Sleep(Duration),
    /// Fails transiently this many times, then passes
    Flaky(u32),
}

struct Probe {
    name: &'static str,
    behaviour: Behaviour,
    calls: AtomicU32,
}

impl Probe {
    fn new(name: &'static str, behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            name,
            behaviour,
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Hook for Probe {
    fn name(&self) -> &str {
        self.name
    }

    async fn call(&self, _exchange: &mut Exchange) -> Result<(), HookError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behaviour {
            Behaviour::Pass => Ok(()),
            Behaviour::Fail => Err(HookError::new(format!("{} failed", self.name))),
            Behaviour::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                Ok(())
            }
            Behaviour::Flaky(failures) if n < failures => Err(HookError::transient("busy")),
            Behaviour::Flaky(_) => Ok(()),
        }
    }
}

fn v(s: &str) -> Version {
    Version::parse(s).unwrap()
}

fn registry(config: &Config) -> Arc<Registry> {
    let registry = Arc::new(Registry::default());
    registry.init(config).unwrap();
    registry
}

fn manager(sink: Arc<MemoryEventSink>) -> RouteManager {
    let config = Config::from_yaml(CONF).unwrap();
    RouteManager::from_config(&config, registry(&config), sink).unwrap()
}

/// Manager whose global hooks are `global` instead of the configured ones
fn manager_with_global(sink: Arc<MemoryEventSink>, global: Vec<HookDescriptor>) -> RouteManager {
    let config = Config::from_yaml(CONF).unwrap();
    RouteManager::new(
        registry(&config),
        Orchestrator::new(HookSet::from_descriptors(global), sink),
        HealthTracker::new(config.health.clone()),
    )
}

fn get_user() -> RouteBinding {
    RouteBinding::new("getUser", v("2.0.0"), Arc::new(GetUser))
}

fn catch_stages(failed: Stage) -> Vec<Stage> {
    let mut expected: Vec<Stage> = Stage::FORWARD
        .iter()
        .copied()
        .take_while(|s| *s != failed)
        .collect();
    expected.push(failed);
    expected.extend(Stage::CATCH);
    expected.push(Stage::Done);
    expected
}

#[tokio::test]
async fn test_old_client_is_served_by_new_handler() {
    let sink = Arc::new(MemoryEventSink::new());
    let manager = manager(sink.clone());
    manager.bind(get_user()).unwrap();

    let response = manager
        .handle(RequestDescriptor::new("getUser", "^1.0.0").with_body(json!({"id": 7})))
        .await
        .unwrap();

    assert_eq!(response.resolved_version, v("1.1.0"));
    assert_eq!(response.authored_version, v("2.0.0"));
    assert_eq!(response.status, StatusCode::OK);
    // request defaulted on the way in, email dropped on the way out
    assert_eq!(
        response.body,
        json!({"id": 7, "name": "Ada", "locale": "en"})
    );
    assert!(!response.substituted);
    assert_eq!(stages(&response.events), Stage::FORWARD.to_vec());
    assert!(response.events.iter().all(|e| e.outcome == Outcome::Ok));
}

#[tokio::test]
async fn test_latest_needs_no_transformation() {
    let manager = manager(Arc::new(MemoryEventSink::new()));
    manager.bind(get_user()).unwrap();

    let request = RequestDescriptor::new("getUser", "latest").with_body(json!({"id": 7}));
    let route = manager.resolve(&request).unwrap();
    assert_eq!(route.resolved_version, v("2.0.0"));
    assert!(!route.needs_transform());
    assert!(route.request_chain.is_empty());

    let response = manager.handle(request).await.unwrap();
    assert_eq!(response.body["email"], "ada@example.com");
    assert_eq!(response.body["locale"], Value::Null);
}

#[tokio::test]
async fn test_request_validation_failure() {
    let sink = Arc::new(MemoryEventSink::new());
    let manager = manager(sink);
    manager.bind(get_user()).unwrap();

    let err = manager
        .handle(RequestDescriptor::new("getUser", "1.1.0").with_body(json!({"id": "seven"})))
        .await
        .unwrap_err();

    assert_eq!(err.failed_stage, Some(Stage::ValidateRequest));
    assert!(matches!(
        err.error,
        RouteError::Validation {
            side: PayloadSide::Request,
            ..
        }
    ));
    assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(stages(&err.events), catch_stages(Stage::ValidateRequest));
    // caller mistakes say nothing about the version's health
    assert!(manager.health().snapshot("getUser", &v("1.1.0")).is_none());
}

#[tokio::test]
async fn test_slow_hook_times_out_into_catch_chain() {
    let manager = manager(Arc::new(MemoryEventSink::new()));
    let slow = Probe::new("slow", Behaviour::Sleep(Duration::from_secs(5)));
    let route_catch = Probe::new("route-catch", Behaviour::Pass);
    manager
        .bind(
            get_user()
                .with_route_hook(
                    HookDescriptor::new(Scope::Route, Phase::Before, slow.clone())
                        .with_timeout(Duration::from_millis(50)),
                )
                .with_route_hook(HookDescriptor::new(
                    Scope::Route,
                    Phase::Catch,
                    route_catch.clone(),
                )),
        )
        .unwrap();

    let started = Instant::now();
    let err = manager
        .handle(RequestDescriptor::new("getUser", "latest").with_body(json!({"id": 1})))
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_millis(50 + 200));
    assert!(matches!(err.error, RouteError::HookTimeout { timeout_ms: 50, .. }));
    assert_eq!(err.failed_stage, Some(Stage::RouteBefore));
    assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(stages(&err.events), catch_stages(Stage::RouteBefore));
    let timed_out = err
        .events
        .iter()
        .find(|e| e.stage == Stage::RouteBefore)
        .unwrap();
    assert_eq!(timed_out.outcome, Outcome::Timeout);
    assert_eq!(route_catch.calls(), 1);
}

#[tokio::test]
async fn test_failing_catch_hook_does_not_stop_the_chain() {
    let global_catch = Probe::new("global-catch", Behaviour::Pass);
    let manager = manager_with_global(
        Arc::new(MemoryEventSink::new()),
        vec![HookDescriptor::new(
            Scope::Global,
            Phase::Catch,
            global_catch.clone(),
        )],
    );
    manager
        .bind(
            get_user()
                .with_local_hook(HookDescriptor::new(
                    Scope::Local,
                    Phase::Before,
                    Probe::new("guard", Behaviour::Fail),
                ))
                .with_local_hook(HookDescriptor::new(
                    Scope::Local,
                    Phase::Catch,
                    Probe::new("broken-catch", Behaviour::Fail),
                )),
        )
        .unwrap();

    let err = manager
        .handle(RequestDescriptor::new("getUser", "latest").with_body(json!({"id": 1})))
        .await
        .unwrap_err();

    // the original error is the one surfaced
    assert!(matches!(err.error, RouteError::HookFailure { ref hook, .. } if hook == "guard"));
    assert_eq!(err.failed_stage, Some(Stage::LocalBefore));
    assert_eq!(global_catch.calls(), 1);

    let failures: Vec<_> = err.catch_failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].hook, "broken-catch");
    assert_eq!(failures[0].stage, Stage::LocalCatch);
    let local_catch = err
        .events
        .iter()
        .find(|e| e.stage == Stage::LocalCatch)
        .unwrap();
    assert_eq!(local_catch.outcome, Outcome::Error);
}

#[tokio::test]
async fn test_idempotent_route_hook_is_retried() {
    let manager = manager(Arc::new(MemoryEventSink::new()));
    let flaky = Probe::new("flaky", Behaviour::Flaky(2));
    manager
        .bind(
            get_user().with_route_hook(
                HookDescriptor::new(Scope::Route, Phase::After, flaky.clone())
                    .with_retry(RetryPolicy::new(3, Backoff::Fixed { delay_ms: 1 }))
                    .idempotent(true),
            ),
        )
        .unwrap();

    let response = manager
        .handle(RequestDescriptor::new("getUser", "latest").with_body(json!({"id": 1})))
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(flaky.calls(), 3);
}

#[tokio::test]
async fn test_configured_route_hooks_apply() {
    let conf = format!(
        "{CONF}    hooks:\n      - name: require-header\n        phase: before\n        config: {{ header: x-tenant }}\n"
    );
    let config = Config::from_yaml(&conf).unwrap();
    let manager = RouteManager::from_config(
        &config,
        registry(&config),
        Arc::new(MemoryEventSink::new()),
    )
    .unwrap();
    manager.bind(get_user()).unwrap();

    let err = manager
        .handle(RequestDescriptor::new("getUser", "latest").with_body(json!({"id": 1})))
        .await
        .unwrap_err();
    assert_eq!(err.failed_stage, Some(Stage::RouteBefore));

    let response = manager
        .handle(
            RequestDescriptor::new("getUser", "latest")
                .with_header("X-Tenant", "acme")
                .with_body(json!({"id": 1})),
        )
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::OK);
}

#[tokio::test]
async fn test_degraded_version_is_avoided() {
    let manager = manager(Arc::new(MemoryEventSink::new()));
    manager.bind(get_user()).unwrap();

    for _ in 0..2 {
        let err = manager
            .handle(RequestDescriptor::new("getUser", "^1.0.0").with_body(json!({"id": 0})))
            .await
            .unwrap_err();
        assert!(matches!(err.error, RouteError::Handler(_)));
        assert_eq!(err.failed_stage, Some(Stage::Handler));
    }
    let health = manager.health().snapshot("getUser", &v("1.1.0")).unwrap();
    assert_eq!((health.samples, health.failures), (2, 2));
    assert!(health.degraded);

    let response = manager
        .handle(RequestDescriptor::new("getUser", "^1.0.0").with_body(json!({"id": 7})))
        .await
        .unwrap();
    assert_eq!(response.resolved_version, v("1.0.0"));
    assert!(response.substituted);
    assert!(response.body.get("email").is_none());

    // an exact request has nowhere else to go
    let route = manager
        .resolve(&RequestDescriptor::new("getUser", "1.1.0"))
        .unwrap();
    assert_eq!(route.resolved_version, v("1.1.0"));
    assert!(!route.substituted);
}

#[tokio::test]
async fn test_concurrent_requests_stay_isolated() {
    let sink = Arc::new(MemoryEventSink::new());
    let manager = manager(sink.clone());
    manager.bind(get_user()).unwrap();

    let requests = (1..=32).map(|id| {
        let spec = if id % 2 == 0 { "latest" } else { "^1.0.0" };
        manager.handle(
            RequestDescriptor::new("getUser", spec)
                .with_correlation_id(format!("req-{id}"))
                .with_body(json!({ "id": id })),
        )
    });
    let responses = futures::future::join_all(requests).await;

    for (i, response) in responses.into_iter().enumerate() {
        let id = i as i64 + 1;
        let response = response.unwrap();
        assert_eq!(response.correlation_id, format!("req-{id}"));
        assert_eq!(response.body["id"], id);
        assert_eq!(response.body.get("email").is_some(), id % 2 == 0);
        assert_eq!(stages(&response.events), Stage::FORWARD.to_vec());
        assert_eq!(
            sink.for_correlation(&response.correlation_id).len(),
            Stage::FORWARD.len()
        );
    }
    assert_eq!(sink.events().len(), 32 * Stage::FORWARD.len());
}

#[tokio::test]
async fn test_correlation_id_is_propagated() {
    let sink = Arc::new(MemoryEventSink::new());
    let manager = manager(sink.clone());
    manager.bind(get_user()).unwrap();

    let minted = RequestDescriptor::new("getUser", "latest");
    assert!(uuid::Uuid::parse_str(&minted.correlation_id).is_ok());

    let response = manager
        .handle(
            RequestDescriptor::new("getUser", "latest")
                .with_correlation_id("req-42")
                .with_body(json!({"id": 1})),
        )
        .await
        .unwrap();
    assert_eq!(response.correlation_id, "req-42");
    assert!(response.events.iter().all(|e| e.correlation_id == "req-42"));
    assert_eq!(sink.for_correlation("req-42"), response.events);
}

#[tokio::test]
async fn test_early_failures_carry_no_events() {
    let sink = Arc::new(MemoryEventSink::new());
    let manager = manager(sink.clone());
    manager.bind(get_user()).unwrap();
    // registered, but nothing connects it to the rest of the graph
    manager
        .registry()
        .register_manifest(
            HandlerManifest::new("getUser", v("3.0.0"), GType::any(), GType::any()),
            false,
        )
        .unwrap();

    let cases = [
        ("^9", StatusCode::NOT_FOUND),
        ("not a version!", StatusCode::BAD_REQUEST),
        ("3.0.0", StatusCode::UNPROCESSABLE_ENTITY),
    ];
    for (spec, status) in cases {
        let err = manager
            .handle(RequestDescriptor::new("getUser", spec).with_correlation_id(spec))
            .await
            .unwrap_err();
        assert_eq!(err.status(), status, "{spec}");
        assert!(err.is_client_fault());
        assert!(err.failed_stage.is_none());
        assert!(err.events.is_empty());
        assert!(sink.for_correlation(spec).is_empty());
    }

    assert!(matches!(
        manager
            .handle(RequestDescriptor::new("getUser", "3.0.0"))
            .await
            .unwrap_err()
            .error,
        RouteError::NoTransformPath { .. }
    ));
}

#[tokio::test]
async fn test_bind_and_unbind() {
    let manager = manager(Arc::new(MemoryEventSink::new()));
    assert!(matches!(
        manager.bind(RouteBinding::new("getUser", v("9.0.0"), Arc::new(GetUser))),
        Err(RouteError::VersionNotFound { .. })
    ));
    assert!(matches!(
        manager.bind(RouteBinding::new("nobody", v("1.0.0"), Arc::new(GetUser))),
        Err(RouteError::UnknownHandler(_))
    ));

    manager.bind(get_user()).unwrap();
    assert!(manager.unbind("getUser"));
    assert!(!manager.unbind("getUser"));

    let err = manager
        .handle(RequestDescriptor::new("getUser", "latest"))
        .await
        .unwrap_err();
    assert!(matches!(err.error, RouteError::UnknownHandler(_)));
    assert_eq!(err.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_response_descriptor_serializes() {
    let manager = manager(Arc::new(MemoryEventSink::new()));
    manager.bind(get_user()).unwrap();
    let response = manager
        .handle(RequestDescriptor::new("getUser", "1.0.0").with_body(json!({"id": 3})))
        .await
        .unwrap();

    let value = serde_json::to_value(&response).unwrap();
    assert_eq!(value["status"], 200);
    assert_eq!(value["resolved_version"], "1.0.0");
    assert_eq!(value["events"][0]["stage"], "INIT");
    assert_eq!(value["events"][0]["outcome"], "ok");
}

#[test]
fn test_request_descriptor_defaults() {
    let request: RequestDescriptor =
        serde_json::from_value(json!({"handler_id": "getUser", "version_spec": "latest"})).unwrap();
    assert_eq!(request.body, Value::Null);
    assert!(request.headers.is_empty());
    assert!(!request.correlation_id.is_empty());
}
