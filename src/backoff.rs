use std::time::Duration;

use rand::Rng;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Delay before the client's next reconnect attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReconnectPolicy {
    Constant(Duration),
    Exponential { base_ms: u64, factor: f64, jitter_ms: u64, max_ms: u64 },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Constant(DEFAULT_RECONNECT_DELAY)
    }
}

impl ReconnectPolicy {
    pub fn constant(delay: Duration) -> Self {
        ReconnectPolicy::Constant(delay)
    }

    pub fn exponential(base: Duration, max: Duration) -> Self {
        ReconnectPolicy::Exponential {
            base_ms: base.as_millis() as u64,
            factor: 2.0,
            jitter_ms: (base.as_millis() as u64 / 2).max(1),
            max_ms: max.as_millis() as u64,
        }
    }

    /// `attempt` counts failures so far, starting at 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            ReconnectPolicy::Constant(delay) => delay,
            ReconnectPolicy::Exponential { base_ms, factor, jitter_ms, max_ms } => {
                Duration::from_millis(backoff_ms(attempt, base_ms, factor, jitter_ms).min(max_ms))
            }
        }
    }
}

pub fn backoff_ms(attempt: u32, base_ms: u64, factor: f64, jitter_ms: u64) -> u64 {
    let pow = factor.powi((attempt.saturating_sub(1)).min(32) as i32);
    let core = (base_ms as f64 * pow).round().min(u64::MAX as f64) as u64;
    let jitter = if jitter_ms > 0 { rand::rng().random_range(0..=jitter_ms) } else { 0 };
    core.saturating_add(jitter)
}
