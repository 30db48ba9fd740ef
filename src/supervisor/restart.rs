//! Restart policy: exponential backoff with jitter and a failure budget.

use std::time::Duration;

use rand::Rng;

use crate::config::RestartConfig;

#[derive(Debug, Clone)]
pub struct RestartPolicy {
    base_ms: u64,
    max_ms: u64,
    max_failures: u32,
}

impl RestartPolicy {
    pub fn new(config: &RestartConfig) -> Self {
        Self {
            base_ms: config.base_delay_ms,
            max_ms: config.max_delay_ms,
            max_failures: config.max_consecutive_failures,
        }
    }

    /// Delay before restart attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        calculate_backoff(attempt, self.base_ms, self.max_ms)
    }

    /// Whether `failures` consecutive failed restarts exhaust the budget.
    pub fn is_exhausted(&self, failures: u32) -> bool {
        failures >= self.max_failures
    }

    pub fn max_failures(&self) -> u32 {
        self.max_failures
    }
}

/// Exponential backoff capped at `max_ms`, plus up to 10% jitter.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::from_millis(0);
    }

    let exponential_base = 2u64.saturating_pow(attempt - 1);
    let delay_ms = base_ms.saturating_mul(exponential_base);
    let capped_delay = delay_ms.min(max_ms);

    let jitter_range = capped_delay / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped_delay + jitter)
}
