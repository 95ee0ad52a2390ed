//! Jittered exponential backoff.

use std::time::Duration;

use rand::Rng;

use crate::config::ReconnectConfig;

/// Lower bound applied after jitter.
pub const MIN_DELAY: Duration = Duration::from_millis(250);

/// Backoff schedule derived from [`ReconnectConfig`].
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
    max_attempts: Option<u32>,
}

impl Backoff {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            initial: config.initial_delay(),
            max: config.max_delay(),
            multiplier: config.multiplier,
            jitter: config.jitter,
            max_attempts: config.max_attempts,
        }
    }

    /// `min(max, initial * multiplier^(attempt-1))`, without jitter.
    ///
    /// `attempt` is 1-based; 0 is treated as 1.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(64) as i32;
        let ms = self.initial.as_millis() as f64 * self.multiplier.powi(exp);
        let max_ms = self.max.as_millis() as f64;
        Duration::from_millis(ms.min(max_ms) as u64)
    }

    /// Base delay with ± jitter, floored at [`MIN_DELAY`] and capped at max.
    pub fn delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        let spread = base.as_millis() as f64 * self.jitter;
        let offset = if spread > 0.0 {
            rng.gen_range(-spread..=spread)
        } else {
            0.0
        };
        let ms = (base.as_millis() as f64 + offset).max(0.0) as u64;
        Duration::from_millis(ms).max(MIN_DELAY).min(self.max.max(MIN_DELAY))
    }

    /// True once `attempt` exceeds the configured cap.
    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt > max)
    }
}
