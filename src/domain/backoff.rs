//! Bounded exponential reconnect backoff
//!
//! Shared by the transcription and synthesis adapters. The delay for attempt
//! `n` is `base_delay * 2^(n-1)`, clamped to `max_delay`, and no more than
//! `max_attempts` attempts are handed out before the backoff reports
//! exhaustion.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reconnect policy configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt
    pub base_delay_ms: u64,
    /// Upper bound for any single delay
    pub max_delay_ms: u64,
    /// Attempts allowed before the adapter gives up
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay to wait before the given 1-based attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let shift = attempt.saturating_sub(1).min(20);
        let ceiling = self.max_delay_ms.max(self.base_delay_ms);
        let millis = self.base_delay_ms.saturating_mul(1u64 << shift).min(ceiling);
        Duration::from_millis(millis)
    }
}

/// Reconnect attempt tracker
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempts: u32,
    current_delay: Duration,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            current_delay: Duration::ZERO,
        }
    }

    /// Record one more attempt and return the delay to wait before it.
    ///
    /// Returns `None` once `max_attempts` have been handed out.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        self.attempts += 1;
        self.current_delay = self.policy.delay_for(self.attempts);
        Some(self.current_delay)
    }

    /// Forget previous failures after a successful connect
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current_delay = Duration::ZERO;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.policy.max_attempts
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }
}
