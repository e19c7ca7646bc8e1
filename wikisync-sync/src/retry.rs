//! Bounded exponential backoff for clone/fetch.
//!
//! Delay before attempt `n + 1` is `base * 2^(n-1)`. Waits are sliced so a
//! cancelled token interrupts them within [`SLEEP_SLICE`].

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use wikisync_core::config::WorkspaceConfig;

const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Attempt budget and base delay for workspace preparation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &WorkspaceConfig) -> Self {
        Self {
            max_attempts: config.max_retry_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
        }
    }

    /// Backoff after the failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

/// Sleep for `duration` unless `cancel` fires first. Returns `false` if cancelled.
pub fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) -> bool {
    let mut remaining = duration;
    while !remaining.is_zero() {
        if cancel.is_cancelled() {
            return false;
        }
        let step = remaining.min(SLEEP_SLICE);
        std::thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
    !cancel.is_cancelled()
}
