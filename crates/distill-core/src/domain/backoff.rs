//! Backoff configuration: decides retry delays.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Maximum fraction by which jitter inflates a delay.
pub const JITTER_FRACTION: f64 = 0.25;

/// Exponential backoff configuration, persisted with every task.
///
/// `delay(n) = min(max_delay, base_delay * multiplier^(n - 1))` where `n` is
/// the number of attempts already made (1-indexed). With `jitter` on, the
/// delay is inflated by up to 25% so tasks that failed together do not retry
/// together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl BackoffConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Upper bound of any delay this config can produce, jitter included.
    pub fn ceiling(&self) -> Duration {
        let max = self.max_delay().as_secs_f64();
        if self.jitter {
            Duration::from_secs_f64(max * (1.0 + JITTER_FRACTION))
        } else {
            self.max_delay()
        }
    }

    /// Delay before the next retry, without jitter.
    ///
    /// Example with base=1s, multiplier=2.0, max=60s:
    /// - attempt 1: 1s
    /// - attempt 2: 2s
    /// - attempt 3: 4s
    /// - attempt 8: 60s (capped)
    pub fn capped_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw_ms = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped_ms = raw_ms.min(self.max_delay_ms as f64);
        if capped_ms.is_finite() && capped_ms > 0.0 {
            Duration::from_secs_f64(capped_ms / 1_000.0)
        } else {
            Duration::ZERO
        }
    }

    /// Delay before the next retry, jittered with `rng` when enabled.
    pub fn delay_with<R: Rng + ?Sized>(&self, attempts: u32, rng: &mut R) -> Duration {
        let delay = self.capped_delay(attempts);
        if !self.jitter {
            return delay;
        }
        let factor = 1.0 + rng.gen_range(0.0..=JITTER_FRACTION);
        Duration::from_secs_f64(delay.as_secs_f64() * factor)
    }

    /// Delay before the next retry using the thread-local rng.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        self.delay_with(attempts, &mut rand::thread_rng())
    }
}
