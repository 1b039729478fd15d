//! Lifecycle hooks and their orchestration.
//!
//! Hooks form a closed set of `scope × phase` slots filled at setup time. Each
//! slot holds descriptors ordered by priority, higher priority first.

pub mod builtin;
pub mod event;
pub mod orchestrator;
pub mod retry;

use std::{fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::core::Hook;

pub use builtin::build_hook;
pub use event::{
    ChannelEventSink, FanoutEventSink, LifecycleEvent, LogEventSink, MemoryEventSink, Outcome,
    Stage,
};
pub use orchestrator::{Orchestrator, OrchestratorPlan};
pub use retry::{Backoff, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Global,
    Route,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Before,
    After,
    Catch,
}

impl Scope {
    /// Lifecycle stage in which hooks of this scope and phase run
    pub fn stage(&self, phase: Phase) -> Stage {
        match (self, phase) {
            (Scope::Global, Phase::Before) => Stage::GlobalBefore,
            (Scope::Route, Phase::Before) => Stage::RouteBefore,
            (Scope::Local, Phase::Before) => Stage::LocalBefore,
            (Scope::Local, Phase::After) => Stage::LocalAfter,
            (Scope::Route, Phase::After) => Stage::RouteAfter,
            (Scope::Global, Phase::After) => Stage::GlobalAfter,
            (Scope::Local, Phase::Catch) => Stage::LocalCatch,
            (Scope::Route, Phase::Catch) => Stage::RouteCatch,
            (Scope::Global, Phase::Catch) => Stage::GlobalCatch,
        }
    }
}

/// Error returned by a hook body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookError {
    message: String,
    transient: bool,
}

impl HookError {
    /// A permanent failure; never retried
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }

    /// A failure an idempotent hook may recover from on a later attempt
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.transient {
            write!(f, "{} (transient)", self.message)
        } else {
            f.write_str(&self.message)
        }
    }
}

impl std::error::Error for HookError {}

impl From<&str> for HookError {
    fn from(message: &str) -> Self {
        HookError::new(message)
    }
}

impl From<String> for HookError {
    fn from(message: String) -> Self {
        HookError::new(message)
    }
}

/// A hook together with how and when it runs
#[derive(Clone)]
pub struct HookDescriptor {
    pub name: String,
    pub scope: Scope,
    pub phase: Phase,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub idempotent: bool,
    pub priority: i32,
    pub hook: Arc<dyn Hook>,
}

impl HookDescriptor {
    pub fn new(scope: Scope, phase: Phase, hook: Arc<dyn Hook>) -> Self {
        Self {
            name: hook.name().to_string(),
            scope,
            phase,
            timeout: Duration::from_millis(1000),
            retry: RetryPolicy::default(),
            idempotent: false,
            priority: 0,
            hook,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Attempts this hook is allowed, accounting for idempotency
    pub fn max_attempts(&self) -> u32 {
        if self.idempotent {
            self.retry.max_attempts.max(1)
        } else {
            1
        }
    }

    pub fn stage(&self) -> Stage {
        self.scope.stage(self.phase)
    }
}

impl fmt::Debug for HookDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookDescriptor")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("phase", &self.phase)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("idempotent", &self.idempotent)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Hooks of one scope, split by phase
#[derive(Debug, Clone, Default)]
pub struct HookSet {
    before: Vec<HookDescriptor>,
    after: Vec<HookDescriptor>,
    catch: Vec<HookDescriptor>,
}

impl HookSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from descriptors, keeping each slot ordered by priority.
    pub fn from_descriptors(descriptors: impl IntoIterator<Item = HookDescriptor>) -> Self {
        let mut set = Self::default();
        for descriptor in descriptors {
            set.push(descriptor);
        }
        set
    }

    pub fn push(&mut self, descriptor: HookDescriptor) {
        let slot = match descriptor.phase {
            Phase::Before => &mut self.before,
            Phase::After => &mut self.after,
            Phase::Catch => &mut self.catch,
        };
        slot.push(descriptor);
        // stable: equal priorities keep registration order
        slot.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    pub fn phase(&self, phase: Phase) -> &[HookDescriptor] {
        match phase {
            Phase::Before => &self.before,
            Phase::After => &self.after,
            Phase::Catch => &self.catch,
        }
    }

    pub fn len(&self) -> usize {
        self.before.len() + self.after.len() + self.catch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
