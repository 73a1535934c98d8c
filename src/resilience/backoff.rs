//! Exponential backoff with optional jitter.

use std::time::Duration;

use rand::Rng;

/// Delay before retry number `attempt` (1-based): `base_ms * 2^(attempt-1)`, capped at `max_ms`.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::from_millis(0);
    }

    let exponential_base = 2u64.saturating_pow(attempt - 1);
    let delay_ms = base_ms.saturating_mul(exponential_base);
    Duration::from_millis(delay_ms.min(max_ms))
}

/// Add 0-10% random jitter to a delay.
pub fn with_jitter(delay: Duration) -> Duration {
    let jitter_range = delay.as_millis() as u64 / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };
    delay + Duration::from_millis(jitter)
}
