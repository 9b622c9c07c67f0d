//! Reconnect backoff for stream sessions.
//!
//! Delays double from one second and are capped at ten; after `MAX_RETRIES`
//! consecutive failures the session gives up and waits for a manual reconnect.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default retry ceiling for a session.
pub const MAX_RETRIES: u32 = 3;

const BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(10);

/// `min(1s * 2^attempt, 10s)`
pub fn next_delay(attempt: u32) -> Duration {
    RetryPolicy::default().next_delay(attempt)
}

/// `attempt < max_retries`
pub fn should_retry(attempt: u32, max_retries: u32) -> bool {
    attempt < max_retries
}

/// Tunable backoff parameters. Defaults match the module constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            base_delay_ms: BASE_DELAY.as_millis() as u64,
            max_delay_ms: MAX_DELAY.as_millis() as u64,
        }
    }
}

impl RetryPolicy {
    pub fn next_delay(&self, attempt: u32) -> Duration {
        // 2^attempt overflows quickly; anything past 2^20 is far beyond the cap
        let factor = 1u64 << attempt.min(20);
        let delay_ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        should_retry(attempt, self.max_retries)
    }
}

/// Consecutive failed attempts for the current session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    attempts: u32,
}

impl RetryState {
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record a failure. Returns the delay before the next attempt, or `None`
    /// once `max_retries` consecutive failures have been counted.
    pub fn record_failure(&mut self, policy: &RetryPolicy) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        if !policy.should_retry(self.attempts) {
            return None;
        }
        Some(policy.next_delay(self.attempts - 1))
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
