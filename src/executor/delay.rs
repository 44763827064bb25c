//! Retry delay computation.

use std::time::Duration;

use rand::Rng;

use crate::config::{
    RATE_LIMIT_BACKOFF_FACTOR, RETRY_JITTER_MS, RETRY_LINEAR_STEP_MS, RETRY_MAX_DELAY_MS,
    RETRY_SEED_MAX_MS, RETRY_SEED_MIN_MS,
};

/// Delay state of one logical request, re-armed after every failed attempt.
///
/// 429s grow the delay exponentially from a seed so rate-limited callers
/// spread out. Other retryable codes get a linear delay with a large random
/// component so they do not retry in lockstep.
#[derive(Debug, Clone)]
pub(crate) struct RetryDelay {
    current_ms: f64,
}

impl RetryDelay {
    /// Seeds the delay from `initial_ms`, or randomly in 500..=2000 ms.
    pub(crate) fn seeded(initial_ms: Option<u64>) -> Self {
        let seed = initial_ms
            .unwrap_or_else(|| rand::rng().random_range(RETRY_SEED_MIN_MS..=RETRY_SEED_MAX_MS));
        Self {
            current_ms: seed as f64,
        }
    }

    /// Delay before retrying after a 429.
    pub(crate) fn after_rate_limit(&mut self) -> Duration {
        self.current_ms = (self.current_ms * RATE_LIMIT_BACKOFF_FACTOR).min(RETRY_MAX_DELAY_MS as f64);
        self.duration()
    }

    /// Delay before retrying after the `failed_attempt`-th transient failure.
    pub(crate) fn after_transient(&mut self, failed_attempt: u32) -> Duration {
        let jitter = rand::rng().random_range(0..=RETRY_JITTER_MS);
        let linear = RETRY_LINEAR_STEP_MS.saturating_mul(u64::from(failed_attempt)) + jitter;
        self.current_ms = (linear as f64).min(RETRY_MAX_DELAY_MS as f64);
        self.duration()
    }

    fn duration(&self) -> Duration {
        Duration::from_millis(self.current_ms.round() as u64)
    }
}
