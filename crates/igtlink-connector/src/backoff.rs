//! Reconnect pacing for persistent client sessions.

use std::time::Duration;

/// Delay before reconnect `attempt` (1-based).
///
/// Exponential: `base * 2^(attempt - 1)`, capped at `max`. Attempt 0 is the
/// immediate retry after a dropped connection and has no delay.
#[must_use]
pub fn reconnect_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let shift = attempt.saturating_sub(1).min(30);
    let delay = base_ms.saturating_mul(1 << shift);
    Duration::from_millis(delay.min(max_ms))
}
