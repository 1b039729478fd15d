//! Rolling per-version health.
//!
//! Each `(handler_id, version)` keeps the outcomes of its most recent requests.
//! Counters live in a `DashMap`, so recording only locks one shard briefly and
//! unrelated versions never contend.

use std::collections::VecDeque;

use dashmap::DashMap;
use log::warn;
use semver::Version;
use serde::Serialize;

use crate::config::HealthConfig;

#[derive(Debug, Default)]
struct RollingWindow {
    /// `true` for a failed request
    outcomes: VecDeque<bool>,
    failures: usize,
}

impl RollingWindow {
    fn push(&mut self, failed: bool, capacity: usize) {
        self.outcomes.push_back(failed);
        if failed {
            self.failures += 1;
        }
        while self.outcomes.len() > capacity {
            if self.outcomes.pop_front() == Some(true) {
                self.failures -= 1;
            }
        }
    }

    fn ratio(&self) -> f64 {
        if self.outcomes.is_empty() {
            0.0
        } else {
            self.failures as f64 / self.outcomes.len() as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub samples: usize,
    pub failures: usize,
    pub failure_ratio: f64,
    pub degraded: bool,
}

pub struct HealthTracker {
    config: HealthConfig,
    windows: DashMap<(String, Version), RollingWindow>,
}

impl HealthTracker {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    /// Record the outcome of one request served as `version`.
    pub fn record(&self, handler_id: &str, version: &Version, success: bool) {
        let key = (handler_id.to_string(), version.clone());
        let mut window = self.windows.entry(key).or_default();
        let was_degraded = self.judge(&window);
        window.push(!success, self.config.window);
        if !was_degraded && self.judge(&window) {
            warn!(
                "'{handler_id}' {version} is degraded: {}/{} recent requests failed",
                window.failures,
                window.outcomes.len()
            );
        }
    }

    pub fn is_degraded(&self, handler_id: &str, version: &Version) -> bool {
        self.windows
            .get(&(handler_id.to_string(), version.clone()))
            .is_some_and(|w| self.judge(&w))
    }

    pub fn snapshot(&self, handler_id: &str, version: &Version) -> Option<HealthSnapshot> {
        self.windows
            .get(&(handler_id.to_string(), version.clone()))
            .map(|w| HealthSnapshot {
                samples: w.outcomes.len(),
                failures: w.failures,
                failure_ratio: w.ratio(),
                degraded: self.judge(&w),
            })
    }

    pub fn reset(&self) {
        self.windows.clear();
    }

    fn judge(&self, window: &RollingWindow) -> bool {
        window.outcomes.len() >= self.config.min_samples
            && window.ratio() > self.config.failure_threshold
    }
}
