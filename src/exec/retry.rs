// src/exec/retry.rs

use std::time::Duration;

use crate::dag::TaskSpec;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(100);
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Attempt budget and exponential backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total worker calls allowed per node (not retries after the first).
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base: DEFAULT_BACKOFF_BASE,
            cap: DEFAULT_BACKOFF_CAP,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base,
            cap,
        }
    }

    /// Attempt budget for `spec`; a per-node override wins.
    pub fn attempts_for(&self, spec: &TaskSpec) -> u32 {
        spec.max_attempts.unwrap_or(self.max_attempts).max(1)
    }

    /// Delay before the attempt following failed attempt `attempt` (1-based):
    /// `min(base * 2^(attempt - 1), cap)`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .map_or(self.cap, |d| d.min(self.cap))
    }
}
