//! Lifecycle state machine.
//!
//! Drives one exchange through the forward stages, and on the first failure
//! through the three catch stages. Every transition is recorded as a
//! [`LifecycleEvent`] and forwarded to the configured sink.

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::Instant,
};

use http::StatusCode;
use log::{debug, error, warn};
use serde_json::Value;

use super::{
    event::{LifecycleEvent, Outcome, Stage},
    HookDescriptor, HookSet, Phase,
};
use crate::{
    core::{
        CatchRecord, EventSink, Exchange, FailureInfo, Handler, PayloadSide, RouteError,
        RouteResult, StructuredError,
    },
    manifest::HandlerManifest,
    schema,
    transform::TransformChain,
};

/// Everything the orchestrator needs to serve one resolved request
#[derive(Clone)]
pub struct OrchestratorPlan {
    /// Manifest of the version the caller is served as
    pub manifest: Arc<HandlerManifest>,
    pub request_chain: TransformChain,
    pub response_chain: TransformChain,
    pub handler: Arc<dyn Handler>,
    pub route_hooks: Arc<HookSet>,
    pub local_hooks: Arc<HookSet>,
}

/// Successful run of the lifecycle
#[derive(Debug, Clone)]
pub struct Completion {
    pub status: StatusCode,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
    pub events: Vec<LifecycleEvent>,
}

pub struct Orchestrator {
    global_hooks: HookSet,
    sink: Arc<dyn EventSink>,
}

impl Orchestrator {
    pub fn new(global_hooks: HookSet, sink: Arc<dyn EventSink>) -> Self {
        Self { global_hooks, sink }
    }

    pub fn global_hooks(&self) -> &HookSet {
        &self.global_hooks
    }

    /// Run the lifecycle of one exchange to completion.
    pub async fn run(
        &self,
        plan: &OrchestratorPlan,
        mut exchange: Exchange,
    ) -> Result<Completion, StructuredError> {
        let mut events = Vec::with_capacity(Stage::FORWARD.len());
        self.record(&mut events, exchange.correlation_id(), Stage::Init, Outcome::Ok);

        match self.forward(plan, &mut exchange, &mut events).await {
            Ok(()) => {
                self.record(&mut events, exchange.correlation_id(), Stage::Done, Outcome::Ok);
                let status = exchange.response.get_status().unwrap_or(StatusCode::OK);
                let headers = exchange.response.headers().clone();
                let body = exchange.response.take_body().unwrap_or(Value::Null);
                Ok(Completion {
                    status,
                    headers,
                    body,
                    events,
                })
            }
            Err((stage, err)) => {
                error!(
                    "[{}] '{}' {} failed at {stage}: {err}",
                    exchange.correlation_id(),
                    exchange.handler_id(),
                    exchange.resolved_version()
                );
                exchange.set_failure(FailureInfo::new(stage, &err));
                let catch_log = self.catch(plan, &mut exchange, &mut events).await;
                self.record(&mut events, exchange.correlation_id(), Stage::Done, Outcome::Error);
                Err(StructuredError {
                    correlation_id: exchange.correlation_id().to_string(),
                    error: err,
                    failed_stage: Some(stage),
                    events,
                    catch_log,
                })
            }
        }
    }

    async fn forward(
        &self,
        plan: &OrchestratorPlan,
        exchange: &mut Exchange,
        events: &mut Vec<LifecycleEvent>,
    ) -> Result<(), (Stage, RouteError)> {
        let inner = &Stage::FORWARD[1..Stage::FORWARD.len() - 1];
        for &stage in inner {
            let result = match stage {
                Stage::GlobalBefore => {
                    self.run_hooks(self.global_hooks.phase(Phase::Before), exchange)
                        .await
                }
                Stage::RouteBefore => {
                    self.run_hooks(plan.route_hooks.phase(Phase::Before), exchange)
                        .await
                }
                Stage::LocalBefore => {
                    self.run_hooks(plan.local_hooks.phase(Phase::Before), exchange)
                        .await
                }
                Stage::ValidateRequest => validate_payload(
                    &exchange.request.body,
                    &plan.manifest.input_schema,
                    PayloadSide::Request,
                ),
                Stage::Handler => run_handler(plan, exchange).await,
                Stage::ValidateResponse => exchange.finished_response().and_then(|(_, body)| {
                    validate_payload(body, &plan.manifest.output_schema, PayloadSide::Response)
                }),
                Stage::LocalAfter => {
                    self.run_hooks(plan.local_hooks.phase(Phase::After), exchange)
                        .await
                }
                Stage::RouteAfter => {
                    self.run_hooks(plan.route_hooks.phase(Phase::After), exchange)
                        .await
                }
                Stage::GlobalAfter => {
                    self.run_hooks(self.global_hooks.phase(Phase::After), exchange)
                        .await
                }
                _ => Ok(()),
            };

            match result {
                Ok(()) => self.record(events, exchange.correlation_id(), stage, Outcome::Ok),
                Err(err) => {
                    self.record(events, exchange.correlation_id(), stage, err.outcome());
                    return Err((stage, err));
                }
            }
        }
        Ok(())
    }

    /// Run the three catch stages. Catch hook failures are recorded, never raised.
    async fn catch(
        &self,
        plan: &OrchestratorPlan,
        exchange: &mut Exchange,
        events: &mut Vec<LifecycleEvent>,
    ) -> Vec<CatchRecord> {
        let stages = [
            (Stage::LocalCatch, plan.local_hooks.phase(Phase::Catch)),
            (Stage::RouteCatch, plan.route_hooks.phase(Phase::Catch)),
            (Stage::GlobalCatch, self.global_hooks.phase(Phase::Catch)),
        ];

        let mut catch_log = Vec::new();
        for (stage, hooks) in stages {
            let mut outcome = Outcome::Ok;
            for descriptor in hooks {
                let record = match self.run_hook(descriptor, exchange).await {
                    Ok(()) => CatchRecord {
                        hook: descriptor.name.clone(),
                        stage,
                        outcome: Outcome::Ok,
                        error: None,
                    },
                    Err(err) => {
                        let failure = RouteError::CatchChain {
                            hook: descriptor.name.clone(),
                            message: err.to_string(),
                        };
                        warn!("[{}] {failure}", exchange.correlation_id());
                        outcome = outcome.worst(err.outcome());
                        CatchRecord {
                            hook: descriptor.name.clone(),
                            stage,
                            outcome: err.outcome(),
                            error: Some(failure.to_string()),
                        }
                    }
                };
                catch_log.push(record);
            }
            self.record(events, exchange.correlation_id(), stage, outcome);
        }
        catch_log
    }

    async fn run_hooks(
        &self,
        hooks: &[HookDescriptor],
        exchange: &mut Exchange,
    ) -> RouteResult<()> {
        for descriptor in hooks {
            self.run_hook(descriptor, exchange).await?;
        }
        Ok(())
    }

    /// Run one hook under its timeout, retrying idempotent hooks.
    ///
    /// On expiry the hook future is dropped, which cancels it at its pending await.
    async fn run_hook(&self, descriptor: &HookDescriptor, exchange: &mut Exchange) -> RouteResult<()> {
        let max_attempts = descriptor.max_attempts();
        let mut attempt = 1;
        loop {
            exchange.set_deadline(Some(Instant::now() + descriptor.timeout));
            let result = tokio::time::timeout(descriptor.timeout, descriptor.hook.call(exchange)).await;
            exchange.set_deadline(None);

            let (err, transient) = match result {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => (
                    RouteError::HookFailure {
                        hook: descriptor.name.clone(),
                        message: e.message().to_string(),
                    },
                    e.is_transient(),
                ),
                Err(_) => (
                    RouteError::HookTimeout {
                        hook: descriptor.name.clone(),
                        timeout_ms: descriptor.timeout.as_millis() as u64,
                    },
                    false,
                ),
            };

            if attempt >= max_attempts || !(transient || err.is_retryable()) {
                return Err(err);
            }

            let delay = descriptor.retry.backoff.delay(attempt);
            debug!(
                "[{}] hook '{}' attempt {attempt}/{max_attempts} failed: {err}; retrying in {delay:?}",
                exchange.correlation_id(),
                descriptor.name
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            attempt += 1;
        }
    }

    fn record(
        &self,
        events: &mut Vec<LifecycleEvent>,
        correlation_id: &str,
        stage: Stage,
        outcome: Outcome,
    ) {
        let event = LifecycleEvent::now(correlation_id, stage, outcome);
        if let Err(e) = self.sink.emit(&event) {
            warn!("[{correlation_id}] failed to emit {stage} event: {e}");
        }
        events.push(event);
    }
}

fn validate_payload(payload: &Value, schema: &schema::GType, side: PayloadSide) -> RouteResult<()> {
    let violations = schema::validate(payload, schema);
    if violations.is_empty() {
        Ok(())
    } else {
        Err(RouteError::Validation { side, violations })
    }
}

/// Adapt the request to the authored version, run the handler, adapt its response back.
async fn run_handler(plan: &OrchestratorPlan, exchange: &mut Exchange) -> RouteResult<()> {
    if !plan.request_chain.is_empty() {
        let body = std::mem::take(&mut exchange.request.body);
        exchange.request.body = plan.request_chain.apply(body)?;
    }

    let (request, response, global, local) = exchange.handler_parts();
    plan.handler
        .handle(request, response, global, local)
        .await
        .map_err(|e| RouteError::Handler(e.to_string()))?;
    exchange.finished_response()?;

    if !plan.response_chain.is_empty() {
        if let Some(body) = exchange.response.take_body() {
            let body = plan.response_chain.apply(body)?;
            exchange.response.body(body);
        }
    }
    Ok(())
}
