//! Exponential backoff calculation
//!
//! Shared by the circuit breaker (cool-down growth after a failed half-open
//! trial) and the forwarding engine (optional pause between attempts).

use rand::Rng;
use std::time::Duration;

/// Exponential backoff: `base * multiplier^level`, capped at `max`
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    /// Delay at level 0
    pub base: Duration,

    /// Upper bound for any level
    pub max: Duration,

    /// Growth factor per level (typically 2.0)
    pub multiplier: f64,

    /// Add up to one extra delay worth of random jitter, still capped at `max`
    pub use_jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            use_jitter: false,
        }
    }
}

impl Backoff {
    /// Create a doubling backoff between `base` and `max`
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            ..Default::default()
        }
    }

    /// Set backoff multiplier
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, use_jitter: bool) -> Self {
        self.use_jitter = use_jitter;
        self
    }

    /// Whether this backoff ever waits at all
    pub fn is_zero(&self) -> bool {
        self.base.is_zero()
    }

    /// Delay for a given level (0-indexed)
    pub fn delay_for(&self, level: u32) -> Duration {
        if self.base.is_zero() {
            return Duration::ZERO;
        }

        let base_ms = self.base.as_millis() as f64;
        let max_ms = self.max.as_millis() as f64;

        // powi saturates to infinity for large levels, min() brings it back
        let delay_ms = (base_ms * self.multiplier.powi(level.min(i32::MAX as u32) as i32)).min(max_ms);

        let delay_ms = if self.use_jitter && delay_ms > 0.0 {
            (delay_ms + rand::thread_rng().gen_range(0.0..delay_ms)).min(max_ms)
        } else {
            delay_ms
        };

        Duration::from_millis(delay_ms as u64)
    }
}
