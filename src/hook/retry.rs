use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Delay between two attempts of an idempotent hook
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    #[default]
    None,
    Fixed {
        delay_ms: u64,
    },
    Exponential {
        base_ms: u64,
        max_ms: u64,
        #[serde(default)]
        jitter: bool,
    },
}

impl Backoff {
    /// Delay to wait after the given (1-based) failed attempt
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            Backoff::Exponential {
                base_ms,
                max_ms,
                jitter,
            } => {
                let shift = attempt.saturating_sub(1).min(32);
                let delay = base_ms.saturating_mul(1u64 << shift).min(*max_ms);
                if *jitter && delay > 1 {
                    let mut rng = rand::thread_rng();
                    Duration::from_millis(rng.gen_range(delay / 2..=delay))
                } else {
                    Duration::from_millis(delay)
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct RetryPolicy {
    #[serde(default = "RetryPolicy::default_max_attempts")]
    #[validate(range(min = 1, max = 16))]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            backoff: Backoff::None,
        }
    }
}

impl RetryPolicy {
    fn default_max_attempts() -> u32 {
        1
    }

    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }
}
