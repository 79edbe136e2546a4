//! Retry policy: backoff delays and supervisor limits.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff with a cap.
///
/// `delay(n) = min(base_delay * 2^n, max_delay)`
///
/// Example with base_delay=5s, max_delay=60s:
/// - n=0: 5s
/// - n=1: 10s
/// - n=2: 20s
/// - n=3: 40s
/// - n=4: 60s (capped)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Backoff {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay_ms: base_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Delay for the n-th step (0-indexed). Non-decreasing in `n`.
    pub fn delay(&self, n: u32) -> Duration {
        let factor = 1u64.checked_shl(n).unwrap_or(u64::MAX);
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_delay_ms: 5_000,
            max_delay_ms: 600_000,
        }
    }
}

/// Limits that drive one supervisor family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorPolicy {
    /// Failed attempts after which the root is terminal.
    pub max_attempts: u32,

    /// Next-check delay, indexed by failed attempt count.
    #[serde(flatten)]
    pub backoff: Backoff,

    /// Ceiling on self re-enqueues. Exceeding it is a logic defect.
    pub max_runs: u32,

    /// Outstanding attempts older than this get a failure fact.
    pub attempt_timeout_ms: Option<u64>,

    /// Enqueue the parent supervisor when this root turns terminal.
    pub notify_parent: bool,
}

impl SupervisorPolicy {
    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout_ms.map(Duration::from_millis)
    }

    pub fn next_check(&self, failed_count: u32) -> Duration {
        self.backoff.delay(failed_count)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_runs(mut self, max_runs: u32) -> Self {
        self.max_runs = max_runs;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }
}

impl Default for SupervisorPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Backoff::default(),
            max_runs: 50,
            attempt_timeout_ms: None,
            notify_parent: true,
        }
    }
}
