//! Reconnect backoff.

use rand::Rng;
use std::time::Duration;

/// Attempts after which the delay stops growing.
pub const MAX_GROWING_ATTEMPT: u32 = 8;

/// Delay before reconnect attempt number `attempt` (starting at 1).
///
/// Grows as `attempt² × 1s`, then settles at 60s plus up to 10s of jitter.
#[must_use]
pub fn reconnect_delay(attempt: u32) -> Duration {
    if attempt > MAX_GROWING_ATTEMPT {
        let jitter = rand::thread_rng().gen_range(0..10_000);
        return Duration::from_millis(60_000 + jitter);
    }
    Duration::from_millis(u64::from(attempt) * u64::from(attempt) * 1000)
}
