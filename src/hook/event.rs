//! Lifecycle stages, events and event sinks.

use std::{
    fmt,
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use crate::core::{ErrorContext, EventSink, RouteResult};

/// States of the per-request lifecycle machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Init,
    GlobalBefore,
    RouteBefore,
    LocalBefore,
    ValidateRequest,
    Handler,
    ValidateResponse,
    LocalAfter,
    RouteAfter,
    GlobalAfter,
    LocalCatch,
    RouteCatch,
    GlobalCatch,
    Done,
}

impl Stage {
    /// Forward path taken by a request that never fails
    pub const FORWARD: [Stage; 11] = [
        Stage::Init,
        Stage::GlobalBefore,
        Stage::RouteBefore,
        Stage::LocalBefore,
        Stage::ValidateRequest,
        Stage::Handler,
        Stage::ValidateResponse,
        Stage::LocalAfter,
        Stage::RouteAfter,
        Stage::GlobalAfter,
        Stage::Done,
    ];

    /// Stages run after any failure, in order
    pub const CATCH: [Stage; 3] = [Stage::LocalCatch, Stage::RouteCatch, Stage::GlobalCatch];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Init => "INIT",
            Stage::GlobalBefore => "GLOBAL_BEFORE",
            Stage::RouteBefore => "ROUTE_BEFORE",
            Stage::LocalBefore => "LOCAL_BEFORE",
            Stage::ValidateRequest => "VALIDATE_REQUEST",
            Stage::Handler => "HANDLER",
            Stage::ValidateResponse => "VALIDATE_RESPONSE",
            Stage::LocalAfter => "LOCAL_AFTER",
            Stage::RouteAfter => "ROUTE_AFTER",
            Stage::GlobalAfter => "GLOBAL_AFTER",
            Stage::LocalCatch => "LOCAL_CATCH",
            Stage::RouteCatch => "ROUTE_CATCH",
            Stage::GlobalCatch => "GLOBAL_CATCH",
            Stage::Done => "DONE",
        }
    }

    pub fn is_catch(&self) -> bool {
        Self::CATCH.contains(self)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Ok,
    Error,
    Timeout,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Ok => "ok",
            Outcome::Error => "error",
            Outcome::Timeout => "timeout",
        }
    }

    /// Combine outcomes of several hooks run in one stage
    pub(crate) fn worst(self, other: Outcome) -> Outcome {
        match (self, other) {
            (Outcome::Error, _) | (_, Outcome::Error) => Outcome::Error,
            (Outcome::Timeout, _) | (_, Outcome::Timeout) => Outcome::Timeout,
            _ => Outcome::Ok,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only record of one stage transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub correlation_id: String,
    pub stage: Stage,
    pub timestamp_nanos: u64,
    pub outcome: Outcome,
}

impl LifecycleEvent {
    pub fn now(correlation_id: &str, stage: Stage, outcome: Outcome) -> Self {
        let timestamp_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        Self {
            correlation_id: correlation_id.to_string(),
            stage,
            timestamp_nanos,
            outcome,
        }
    }
}

/// Stage sequence of a recorded event list
#[cfg(test)]
pub(crate) fn stages(events: &[LifecycleEvent]) -> Vec<Stage> {
    events.iter().map(|e| e.stage).collect()
}

/// Sink writing each event through the `log` facade
#[derive(Default)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn emit(&self, event: &LifecycleEvent) -> RouteResult<()> {
        log::debug!(
            target: "timescape::lifecycle",
            correlation_id = event.correlation_id.as_str(),
            stage = event.stage.as_str(),
            outcome = event.outcome.as_str(),
            timestamp_nanos = event.timestamp_nanos;
            "lifecycle event"
        );
        Ok(())
    }
}

/// Sink retaining every event, for inspection and replay
#[derive(Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn for_correlation(&self, correlation_id: &str) -> Vec<LifecycleEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.correlation_id == correlation_id)
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: &LifecycleEvent) -> RouteResult<()> {
        self.events
            .lock()
            .with_context("event sink lock")?
            .push(event.clone());
        Ok(())
    }
}

/// Sink forwarding events to an async consumer
pub struct ChannelEventSink {
    sender: UnboundedSender<LifecycleEvent>,
}

impl ChannelEventSink {
    pub fn new(sender: UnboundedSender<LifecycleEvent>) -> Self {
        Self { sender }
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: &LifecycleEvent) -> RouteResult<()> {
        self.sender
            .send(event.clone())
            .with_context("event channel closed")
    }
}

/// Fan an event out to several sinks; the first failure is reported after all ran
pub struct FanoutEventSink {
    sinks: Vec<std::sync::Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    pub fn new(sinks: Vec<std::sync::Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutEventSink {
    fn emit(&self, event: &LifecycleEvent) -> RouteResult<()> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.emit(event) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_stage_serializes_screaming_case() {
        let json = serde_json::to_string(&Stage::ValidateRequest).unwrap();
        assert_eq!(json, "\"VALIDATE_REQUEST\"");
        assert_eq!(Stage::GlobalCatch.to_string(), "GLOBAL_CATCH");
        assert!(Stage::RouteCatch.is_catch());
        assert!(!Stage::Done.is_catch());
    }

    #[test]
    fn test_outcome_worst() {
        assert_eq!(Outcome::Ok.worst(Outcome::Ok), Outcome::Ok);
        assert_eq!(Outcome::Ok.worst(Outcome::Timeout), Outcome::Timeout);
        assert_eq!(Outcome::Timeout.worst(Outcome::Error), Outcome::Error);
    }

    #[test]
    fn test_memory_sink_filters_by_correlation() {
        let sink = MemoryEventSink::new();
        sink.emit(&LifecycleEvent::now("a", Stage::Init, Outcome::Ok))
            .unwrap();
        sink.emit(&LifecycleEvent::now("b", Stage::Init, Outcome::Ok))
            .unwrap();
        sink.emit(&LifecycleEvent::now("a", Stage::Done, Outcome::Ok))
            .unwrap();
        assert_eq!(stages(&sink.for_correlation("a")), vec![Stage::Init, Stage::Done]);
        assert_eq!(sink.events().len(), 3);
    }

    #[tokio::test]
    async fn test_channel_sink_reports_closed_channel() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sink = ChannelEventSink::new(tx);
        sink.emit(&LifecycleEvent::now("a", Stage::Init, Outcome::Ok))
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().stage, Stage::Init);

        drop(rx);
        assert!(sink
            .emit(&LifecycleEvent::now("a", Stage::Done, Outcome::Ok))
            .is_err());
    }

    #[test]
    fn test_fanout_runs_every_sink() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        drop(rx);
        let memory = Arc::new(MemoryEventSink::new());
        let fanout = FanoutEventSink::new(vec![
            Arc::new(ChannelEventSink::new(tx)),
            memory.clone(),
        ]);
        assert!(fanout
            .emit(&LifecycleEvent::now("a", Stage::Init, Outcome::Ok))
            .is_err());
        assert_eq!(memory.events().len(), 1);
    }
}
