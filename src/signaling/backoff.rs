//! Reconnect backoff for the relay link: exponential growth with full
//! jitter. Each delay is drawn uniformly from `[0, min(base * 2^attempt,
//! cap)]`, which spreads reconnect storms across the whole interval instead
//! of clustering at the cap.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Initial ceiling in milliseconds.
    pub base_ms: u64,
    /// Absolute ceiling in milliseconds.
    pub max_ms: u64,
    /// Exponential growth multiplier per attempt.
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 5_000,
            max_ms: 60_000,
            multiplier: 2.0,
        }
    }
}

/// The ceiling for `attempt` (0-indexed): `min(base * multiplier^attempt, max)`.
pub fn ceiling_ms(attempt: u32, config: &BackoffConfig) -> u64 {
    let raw = config.base_ms as f64 * config.multiplier.powi(attempt.min(32) as i32);
    raw.min(config.max_ms as f64) as u64
}

/// Next delay with full jitter: uniform in `[0, ceiling]`.
pub fn next_backoff(attempt: u32, config: &BackoffConfig) -> Duration {
    let ceiling = ceiling_ms(attempt, config);
    Duration::from_millis(pseudo_rand(attempt) % (ceiling + 1))
}

pub async fn backoff_sleep(attempt: u32, config: &BackoffConfig) {
    tokio::time::sleep(next_backoff(attempt, config)).await;
}

/// One LCG step seeded by the attempt number and the clock, avoiding a rand
/// dependency for a delay spread.
fn pseudo_rand(attempt: u32) -> u64 {
    // LCG parameters (Numerical Recipes)
    const A: u64 = 1_664_525;
    const C: u64 = 1_013_904_223;
    let seed = std::time::SystemTime::UNIX_EPOCH
        .elapsed()
        .unwrap_or_default()
        .subsec_nanos() as u64
        ^ ((attempt as u64) << 32);
    A.wrapping_mul(seed).wrapping_add(C)
}
