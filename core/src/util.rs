use std::time::Duration;

use rand::Rng;

const BACKOFF_FACTOR: f64 = 2.0;

/// Jittered exponential backoff for transient transport retries.
///
/// `attempt` is 1-based; the delay doubles per attempt from `base` and is
/// clamped to `cap` before jitter is applied.
pub fn backoff(attempt: u64, base: Duration, cap: Duration) -> Duration {
    let exp = BACKOFF_FACTOR.powi(attempt.saturating_sub(1) as i32);
    let millis = ((base.as_millis() as f64) * exp).min(cap.as_millis() as f64);
    let jitter = rand::rng().random_range(0.9..1.1);
    Duration::from_millis((millis * jitter) as u64)
}
